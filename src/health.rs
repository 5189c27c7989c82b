//! HTTP and TCP readiness probes.

use std::time::Duration;

use tokio::net::TcpStream;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

fn client() -> Option<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("hstack/{}", env!("CARGO_PKG_VERSION")))
        .timeout(PROBE_TIMEOUT)
        .build()
        .ok()
}

/// One GET; true on a 2xx answer.
pub async fn http_ok(url: &str) -> bool {
    let Some(client) = client() else {
        return false;
    };
    match client.get(url).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Polls `url` until it answers 2xx or `timeout` elapses.
pub async fn wait_for_http_ok(url: &str, timeout: Duration, interval: Duration) -> bool {
    let Some(client) = client() else {
        return false;
    };
    let end = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(response) = client.get(url).send().await {
            if response.status().is_success() {
                return true;
            }
        }
        if tokio::time::Instant::now() + interval > end {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Polls until `127.0.0.1:port` accepts a connection or `timeout` elapses.
pub async fn wait_for_tcp(port: u16, timeout: Duration, interval: Duration) -> bool {
    let addr = format!("127.0.0.1:{}", port);
    let end = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < end {
        if TcpStream::connect(&addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let body = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                    status
                );
                let _ = socket.write_all(body.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn http_ok_accepts_2xx_only() {
        let ok = serve_once("200 OK").await;
        let bad = serve_once("503 Service Unavailable").await;
        assert!(http_ok(&format!("http://127.0.0.1:{}/health", ok)).await);
        assert!(!http_ok(&format!("http://127.0.0.1:{}/health", bad)).await);
    }

    #[tokio::test]
    async fn wait_gives_up_after_timeout() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{}/health", port);
        let ok = wait_for_http_ok(&url, Duration::from_millis(400), Duration::from_millis(100)).await;
        assert!(!ok);
        assert!(!wait_for_tcp(port, Duration::from_millis(300), Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn tcp_wait_sees_listener() {
        let port = serve_once("200 OK").await;
        assert!(wait_for_tcp(port, Duration::from_secs(2), Duration::from_millis(50)).await);
    }
}
