//! HTTP reachability probes for health endpoints and the issued certificate.
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn http_agent() -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(PROBE_TIMEOUT))
        .http_status_as_error(false)
        .build()
        .into()
}

/// `None` when `url` answers 2xx and any JSON `status` field reads "ok".
pub(crate) fn check_health(agent: &ureq::Agent, url: &str) -> Option<String> {
    let mut response = match agent.get(url).call() {
        Ok(response) => response,
        Err(err) => return Some(format!("health check {url} unreachable: {err}")),
    };
    let status = response.status();
    let body = response.body_mut().read_to_string().unwrap_or_default();
    if !status.is_success() {
        return Some(format!(
            "health check {url} returned HTTP {}",
            status.as_u16()
        ));
    }
    let reported = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| value.get("status").and_then(|s| s.as_str()).map(str::to_string));
    match reported {
        Some(state) if state != "ok" => {
            Some(format!("health check {url} reported status {state:?}"))
        }
        _ => None,
    }
}

/// Any HTTP answer over TLS counts as reachable; only transport errors warn.
pub(crate) fn probe_https(agent: &ureq::Agent, domain: &str) -> Option<String> {
    let url = format!("https://{domain}/");
    match agent.get(&url).call() {
        Ok(_) | Err(ureq::Error::StatusCode(_)) => None,
        Err(err) => Some(format!("{url} not reachable over HTTPS: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf);
                let reply = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        format!("http://{addr}/healthcheck/db")
    }

    #[test]
    fn healthy_endpoint_produces_no_warning() {
        let url = serve_once("200 OK", r#"{"status":"ok"}"#);
        assert_eq!(check_health(&http_agent(), &url), None);
    }

    #[test]
    fn error_status_is_reported() {
        let url = serve_once("503 Service Unavailable", r#"{"detail":"db down"}"#);
        let warning = check_health(&http_agent(), &url).expect("warning");
        assert!(warning.contains("HTTP 503"), "{warning}");
    }

    #[test]
    fn degraded_status_field_is_reported() {
        let url = serve_once("200 OK", r#"{"status":"degraded"}"#);
        let warning = check_health(&http_agent(), &url).expect("warning");
        assert!(warning.contains("degraded"), "{warning}");
    }

    #[test]
    fn refused_connection_is_reported() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let url = format!("http://127.0.0.1:{port}/healthcheck/db");
        let warning = check_health(&http_agent(), &url).expect("warning");
        assert!(warning.contains("unreachable"), "{warning}");
    }
}
