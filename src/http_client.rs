//! HTTP agent construction, bounded response reads and retry helpers.

use std::io::{self, Read};
use std::time::Duration;

/// Timeouts applied to every request made through an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub connect: Duration,
    /// Upper bound on waiting for response bytes; a hung server cannot
    /// stall a poll loop past this.
    pub read: Duration,
    pub write: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(240),
            write: Duration::from_secs(30),
        }
    }
}

/// Retry settings for network operations with exponential backoff.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryConfig {
    /// Maximum number of attempts, including the first try.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

pub(crate) fn build_agent(timeouts: HttpTimeouts) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(timeouts.connect)
        .timeout_read(timeouts.read)
        .timeout_write(timeouts.write)
        .build()
}

/// Retry an operation with bounded exponential backoff when the predicate allows it.
pub(crate) fn retry_with_backoff<T, E, F, R>(
    config: RetryConfig,
    mut action: F,
    mut should_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: FnMut(&E) -> bool,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match action() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                let delay = backoff_delay(config.base_delay, config.max_delay, attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                std::thread::sleep(delay);
            }
        }
    }
}

/// Read a response into memory, enforcing a maximum byte size.
pub(crate) fn read_response_bytes(
    response: ureq::Response,
    max_bytes: usize,
) -> Result<Vec<u8>, io::Error> {
    check_content_length(&response, max_bytes)?;
    let mut limited = response.into_reader().take(max_bytes as u64 + 1);
    let mut bytes = Vec::new();
    limited.read_to_end(&mut bytes)?;
    if bytes.len() > max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Response exceeded {max_bytes} bytes"),
        ));
    }
    Ok(bytes)
}

fn check_content_length(response: &ureq::Response, max_bytes: usize) -> Result<(), io::Error> {
    let Some(length) = response
        .header("Content-Length")
        .and_then(|length| length.parse::<u64>().ok())
    else {
        return Ok(());
    };
    if length > max_bytes as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Response too large: {length} bytes"),
        ));
    }
    Ok(())
}

fn backoff_delay(base: Duration, max: Duration, attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    /// Serve exactly one canned HTTP response; returns the base URL and a
    /// handle yielding the raw request text.
    pub(crate) fn serve_once(response: String) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return String::new();
            };
            let mut buf = [0u8; 4096];
            let read = stream.read(&mut buf).unwrap_or(0);
            let _ = stream.write_all(response.as_bytes());
            String::from_utf8_lossy(&buf[..read]).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    pub(crate) fn ok_response(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn read_response_bytes_rejects_content_length_over_max() {
        let (url, _server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nok".to_string(),
        );
        let response = build_agent(HttpTimeouts::default()).get(&url).call().unwrap();
        let err = read_response_bytes(response, 10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_response_bytes_rejects_body_over_max() {
        let body = "a".repeat(32);
        let (url, _server) = serve_once(format!("HTTP/1.0 200 OK\r\n\r\n{body}"));
        let response = build_agent(HttpTimeouts::default()).get(&url).call().unwrap();
        let err = read_response_bytes(response, 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_response_bytes_accepts_under_limit() {
        let (url, _server) = serve_once(ok_response("hello"));
        let response = build_agent(HttpTimeouts::default()).get(&url).call().unwrap();
        assert_eq!(read_response_bytes(response, 16).unwrap(), b"hello");
    }

    #[test]
    fn retry_with_backoff_stops_after_success() {
        let mut attempts = 0usize;
        let config = RetryConfig {
            max_attempts: 4,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        let result: Result<u32, &'static str> = retry_with_backoff(
            config,
            || {
                attempts += 1;
                if attempts < 3 { Err("fail") } else { Ok(7) }
            },
            |_| true,
        );
        assert_eq!(result, Ok(7));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn retry_with_backoff_honors_should_retry() {
        let mut attempts = 0usize;
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        let result: Result<u32, &'static str> = retry_with_backoff(
            config,
            || {
                attempts += 1;
                Err("fail")
            },
            |_| false,
        );
        assert_eq!(result, Err("fail"));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn backoff_is_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, max, 1), base);
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, max, 3), max);
        assert_eq!(backoff_delay(base, max, 64), max);
    }
}
