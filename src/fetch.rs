use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONTENT_TYPE, PRAGMA, USER_AGENT};
use reqwest::Client;
use url::Url;

use crate::config::RetryPolicy;
use crate::error::FetchError;

const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

static RE_META_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?\s*([a-z0-9_\-:.]+)"#).unwrap()
});

pub fn build_client() -> Result<Client, FetchError> {
    Ok(Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?)
}

/// Runs `op` up to `policy.max_attempts` times, sleeping per the backoff policy
/// between failures. The last failure is returned untouched.
///
/// `op` receives the 1-indexed attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Fetch attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One GET of `url`; any non-2xx status is an error.
pub async fn fetch_once(client: &Client, url: &Url) -> Result<String, FetchError> {
    let resp = client
        .get(url.as_str())
        .header(USER_AGENT, MOBILE_USER_AGENT)
        .header(ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
        .header(ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9,en;q=0.8")
        .header(CACHE_CONTROL, "no-cache")
        .header(PRAGMA, "no-cache")
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        });
    }

    let header_charset = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(charset_from_content_type);
    let bytes = resp.bytes().await?;
    tracing::debug!(url = %url, bytes = bytes.len(), "Downloaded page");

    Ok(decode_body(&bytes, header_charset.as_deref()))
}

/// [`fetch_once`] under [`retry`].
pub async fn fetch_page(client: &Client, url: &Url, policy: &RetryPolicy) -> Result<String, FetchError> {
    retry(policy, |attempt| {
        tracing::debug!(url = %url, attempt = attempt, "Fetching page");
        fetch_once(client, url)
    })
    .await
}

fn charset_from_content_type(value: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(val.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// Header charset wins, then a `<meta>` declaration near the top, then UTF-8.
fn decode_body(bytes: &[u8], header_charset: Option<&str>) -> String {
    let sniffed = || {
        let head = &bytes[..bytes.len().min(1024)];
        RE_META_CHARSET
            .captures(head)
            .and_then(|c| c.get(1))
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
    };
    let label = header_charset.map(str::to_string).or_else(sniffed);
    let encoding = label
        .and_then(|l| encoding_rs::Encoding::for_label(l.as_bytes()))
        .unwrap_or(encoding_rs::UTF_8);
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        tracing::debug!(encoding = encoding.name(), "Page contained undecodable bytes");
    }
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 500,
            max_delay_ms: 8000,
        }
    }

    async fn flaky(calls: &AtomicU32, failures: u32) -> Result<u32, String> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            Err(format!("failure #{}", n))
        } else {
            Ok(n)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures_when_ceiling_allows() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast_policy(3), |_| flaky(&calls, 2)).await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_ceiling_with_last_error() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast_policy(3), |_| flaky(&calls, 5)).await;
        assert_eq!(result, Err("failure #3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_equal_to_failures_still_fails() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast_policy(2), |_| flaky(&calls, 2)).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn passes_attempt_numbers_in_order() {
        let seen = std::sync::Mutex::new(Vec::new());
        let _ = retry(&fast_policy(4), |attempt| {
            seen.lock().unwrap().push(attempt);
            async move { Err::<(), _>("nope") }
        })
        .await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    /// Collects formatted log lines from a scoped subscriber.
    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl CapturedLog {
        fn lines(&self) -> Vec<String> {
            let buf = self.0.lock().unwrap();
            String::from_utf8_lossy(&buf).lines().map(str::to_string).collect()
        }
    }

    impl std::io::Write for CapturedLog {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLog {
        type Writer = CapturedLog;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn each_retry_logs_attempt_delay_and_error() {
        let log = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(log.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let calls = AtomicU32::new(0);
        let result = retry(&fast_policy(3), |_| flaky(&calls, 5)).await;
        assert!(result.is_err());

        let lines = log.lines();
        assert_eq!(lines.len(), 2, "{:#?}", lines);
        for (i, line) in lines.iter().enumerate() {
            let attempt = i + 1;
            assert!(line.contains("WARN"), "{}", line);
            assert!(line.contains(&format!(" attempt={}", attempt)), "{}", line);
            assert!(line.contains("max_attempts=3"), "{}", line);
            assert!(line.contains("delay_ms="), "{}", line);
            assert!(line.contains(&format!("error=failure #{}", attempt)), "{}", line);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts_without_blocking() {
        let start = tokio::time::Instant::now();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
        };
        let _ = retry(&policy, |_| flaky(&calls, 1)).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn fetch_sends_browser_and_no_cache_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hot"))
            .and(header("pragma", "no-cache"))
            .and(header("cache-control", "no-cache"))
            .and(header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let client = build_client().unwrap();
        let url = Url::parse(&format!("{}/hot", server.uri())).unwrap();
        let body = fetch_once(&client, &url).await.unwrap();
        assert_eq!(body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
            .mount(&server)
            .await;

        let client = build_client().unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        match fetch_once(&client, &url).await {
            Err(FetchError::HttpStatus { status, reason }) => {
                assert_eq!(status, 404);
                assert_eq!(reason, "Not Found");
            }
            other => panic!("expected HttpStatus, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fetch_page_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("third time"))
            .expect(1)
            .mount(&server)
            .await;

        let client = build_client().unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        assert_eq!(fetch_page(&client, &url, &policy).await.unwrap(), "third time");
    }

    #[test]
    fn charset_comes_from_content_type() {
        assert_eq!(
            charset_from_content_type("text/html; charset=GBK").as_deref(),
            Some("GBK")
        );
        assert_eq!(
            charset_from_content_type("text/html;charset=\"utf-8\"").as_deref(),
            Some("utf-8")
        );
        assert_eq!(charset_from_content_type("text/html"), None);
    }

    #[test]
    fn decodes_gbk_declared_in_meta() {
        let (encoded, _, _) = encoding_rs::GBK.encode("<meta charset=\"gbk\"><p>原创</p>");
        let text = decode_body(&encoded, None);
        assert!(text.contains("原创"));
    }

    #[test]
    fn header_charset_overrides_meta() {
        let (encoded, _, _) = encoding_rs::GBK.encode("<meta charset=\"utf-8\">视频");
        assert!(decode_body(&encoded, Some("gb18030")).contains("视频"));
    }

    #[test]
    fn defaults_to_utf8() {
        assert_eq!(decode_body("作者".as_bytes(), None), "作者");
    }
}
