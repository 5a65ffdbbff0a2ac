//! Shared test infrastructure for integration tests.
//!
//! A `Host` is a temp dir holding fake `git`, `docker`, `nginx`, reload and
//! `certbot` scripts that append their argv to a log, plus a source
//! repository the fake `git clone` copies into the target directory.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

pub const REPO_URL: &str = "https://git.example.com/booking.git";
pub const ENV_TEMPLATE: &str = "# booking secrets\nPOSTGRES_PASSWORD=\nSECRET_KEY=\n";
pub const ENV_EDITED: &str = "# booking secrets\nPOSTGRES_PASSWORD=s3cret\nSECRET_KEY=abc123\n";
pub const SITE_CONF: &str = "server {\n    listen 80;\n    server_name example.com www.example.com;\n    location / { proxy_pass http://127.0.0.1:8000; }\n}\n";

const PRELUDE: &str = r#"#!/bin/sh
echo "$(basename "$0") $*" >> "$BDEPLOY_TEST_LOG"
if [ -n "$BDEPLOY_TEST_FAIL" ]; then
  case "$(basename "$0") $*" in
    *"$BDEPLOY_TEST_FAIL"*) echo "simulated failure: $BDEPLOY_TEST_FAIL" >&2; exit 1 ;;
  esac
fi
"#;

const GIT_BODY: &str = r#"if [ "$1" = "clone" ]; then
  for last; do :; done
  mkdir -p "$last" && cp -R "$BDEPLOY_TEST_REPO/." "$last/"
  exit 0
fi
if [ "$1" = "-C" ] && [ "$3" = "remote" ]; then
  cat "$2/.git/origin-url"
fi
exit 0
"#;

const DOCKER_BODY: &str = r#"case "$*" in
  *"config --services"*|*"ps --services"*) printf 'app\ndb\n' ;;
  *"alembic current"*) [ -f "$BDEPLOY_TEST_STATE/revision" ] && cat "$BDEPLOY_TEST_STATE/revision" ;;
  *"alembic upgrade head"*) echo "9f8e (head)" > "$BDEPLOY_TEST_STATE/revision" ;;
esac
exit 0
"#;

const CERTBOT_BODY: &str = r##"fullchain="$BDEPLOY_TEST_LIVE/example.com/fullchain.pem"
mkdir -p "$BDEPLOY_TEST_LIVE/example.com"
[ -f "$fullchain" ] || echo "-----BEGIN CERTIFICATE-----" > "$fullchain"
echo "# ssl_certificate $fullchain; # managed by Certbot" >> "$BDEPLOY_TEST_SITE"
exit 0
"##;

pub struct Host {
    pub dir: TempDir,
}

impl Host {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let host = Self { dir };
        for dir in ["bin", "repo/.git", "repo/infra/nginx", "state", "nginx/available", "nginx/enabled"] {
            fs::create_dir_all(host.path(dir)).expect("create host dir");
        }
        host.script("git", GIT_BODY);
        host.script("docker", DOCKER_BODY);
        host.script("nginx", "exit 0\n");
        host.script("reload", "exit 0\n");
        host.script("certbot", CERTBOT_BODY);

        fs::write(host.path("repo/.git/origin-url"), format!("{REPO_URL}\n")).expect("origin");
        fs::write(host.path("repo/infra/.env.example"), ENV_TEMPLATE).expect("template");
        fs::write(host.path("repo/infra/docker-compose.yml"), "services:\n  app: {}\n  db: {}\n")
            .expect("compose file");
        fs::write(host.path("repo/infra/nginx/booking.conf"), SITE_CONF).expect("site");
        host
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn deploy_root(&self) -> PathBuf {
        self.path("deploy")
    }

    pub fn target_dir(&self) -> PathBuf {
        self.path("srv/booking")
    }

    pub fn env_file(&self) -> PathBuf {
        self.target_dir().join("infra/.env")
    }

    pub fn site_available(&self) -> PathBuf {
        self.path("nginx/available/booking")
    }

    pub fn site_enabled(&self) -> PathBuf {
        self.path("nginx/enabled/booking")
    }

    fn script(&self, name: &str, body: &str) {
        let path = self.path("bin").join(name);
        fs::write(&path, format!("{PRELUDE}{body}")).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
    }

    fn tool(&self, name: &str) -> String {
        self.path("bin").join(name).display().to_string()
    }

    /// `bdeploy init`, then point every host path and tool into the temp dir.
    pub fn init(&self) {
        let root = self.deploy_root();
        let target = self.target_dir();
        let output = self.bdeploy(
            &[
                "init",
                "--deploy-root",
                &root.display().to_string(),
                "--name",
                "booking",
                "--repo",
                REPO_URL,
                "--target-dir",
                &target.display().to_string(),
                "--domain",
                "example.com",
                "--domain",
                "www.example.com",
            ],
            None,
        );
        assert_success(&output);

        self.edit_config(|config| {
            config["secrets"]["required_keys"] = serde_json::json!(["POSTGRES_PASSWORD", "SECRET_KEY"]);
            config["compose"]["launch_timeout_seconds"] = serde_json::json!(0);
            config["proxy"]["sites_available"] = path_json(&self.path("nginx/available"));
            config["proxy"]["sites_enabled"] = path_json(&self.path("nginx/enabled"));
            config["certificate"]["live_dir"] = path_json(&self.path("letsencrypt/live"));
            config["certificate"]["verify_https"] = serde_json::json!(false);
            config["tools"] = serde_json::json!({
                "git": self.tool("git"),
                "docker": self.tool("docker"),
                "compose": [self.tool("docker"), "compose"],
                "nginx": self.tool("nginx"),
                "reload": [self.tool("reload")],
                "certbot": self.tool("certbot"),
            });
        });
    }

    pub fn edit_config(&self, edit: impl FnOnce(&mut serde_json::Value)) {
        let path = self.deploy_root().join("deploy.json");
        let text = fs::read_to_string(&path).expect("read deploy.json");
        let mut config: serde_json::Value = serde_json::from_str(&text).expect("parse deploy.json");
        edit(&mut config);
        let text = serde_json::to_string_pretty(&config).expect("serialize deploy.json");
        fs::write(&path, text).expect("write deploy.json");
    }

    /// Run `bdeploy <args> --deploy-root <root>`; `fail` makes any tool whose
    /// command line contains it exit 1.
    pub fn apply(&self, extra: &[&str], fail: Option<&str>) -> Output {
        let root = self.deploy_root().display().to_string();
        let mut args = vec!["apply", "--deploy-root", root.as_str()];
        args.extend_from_slice(extra);
        self.bdeploy(&args, fail)
    }

    pub fn status_json(&self) -> serde_json::Value {
        let root = self.deploy_root().display().to_string();
        let output = self.bdeploy(&["status", "--deploy-root", &root, "--json"], None);
        assert_success(&output);
        serde_json::from_slice(&output.stdout).expect("status json")
    }

    pub fn bdeploy(&self, args: &[&str], fail: Option<&str>) -> Output {
        Command::new(env!("CARGO_BIN_EXE_bdeploy"))
            .args(args)
            .env("BDEPLOY_TEST_LOG", self.path("tools.log"))
            .env("BDEPLOY_TEST_REPO", self.path("repo"))
            .env("BDEPLOY_TEST_STATE", self.path("state"))
            .env("BDEPLOY_TEST_LIVE", self.path("letsencrypt/live"))
            .env("BDEPLOY_TEST_SITE", self.site_available())
            .env("BDEPLOY_TEST_FAIL", fail.unwrap_or_default())
            .env_remove("BDEPLOY_LOG")
            .output()
            .expect("run bdeploy")
    }

    /// Every tool invocation so far, one line per call.
    pub fn tool_log(&self) -> Vec<String> {
        fs::read_to_string(self.path("tools.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn count_calls(&self, needle: &str) -> usize {
        self.tool_log()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }
}

fn path_json(path: &Path) -> serde_json::Value {
    serde_json::Value::String(path.display().to_string())
}

pub fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "bdeploy failed ({:?})\nstdout:\n{}\nstderr:\n{}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn assert_exit(output: &Output, code: i32) {
    assert_eq!(
        output.status.code(),
        Some(code),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}
