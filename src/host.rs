//! Host-side routes and request parsing for the `kiln` binary

use serde_json::{json, Value};
use std::io::{self, BufRead};
use std::sync::{Arc, Weak};
use std::thread;
use tokio::sync::mpsc;

use crate::registry::{ApiArgs, ExtensionRegistry, RegistryError};

pub const ROUTE_API_LIST: &str = "/index/api/getApiList";
pub const ROUTE_VERSION: &str = "/index/api/version";

/// Install the routes the host always provides
///
/// # Errors
/// Returns an error if one of the names is already registered
pub fn register_builtin_routes(registry: &Arc<ExtensionRegistry>) -> Result<(), RegistryError> {
    // Weak, so the registry does not keep itself alive through its own handler
    let weak: Weak<ExtensionRegistry> = Arc::downgrade(registry);
    registry.register(ROUTE_API_LIST, move |_: &ApiArgs, val: &mut Value| {
        let routes: Vec<String> = weak
            .upgrade()
            .map(|r| r.routes().into_iter().map(|(name, _)| name).collect())
            .unwrap_or_default();
        val["code"] = json!(0);
        val["data"] = json!(routes);
    })?;

    registry.register(ROUTE_VERSION, |_: &ApiArgs, val: &mut Value| {
        val["code"] = json!(0);
        val["data"] = json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "entry_symbol": kiln_abi::ENTRY_SYMBOL,
        });
    })?;

    Ok(())
}

/// A request line: `<route> [key=value ...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub route: String,
    pub args: ApiArgs,
}

/// Parse one request line. Blank lines and `#` comments yield `None`.
///
/// Tokens without `=` become arguments with an empty value.
#[must_use]
pub fn parse_request(line: &str) -> Option<Request> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut tokens = line.split_whitespace();
    let route = tokens.next()?.to_string();
    let args = tokens
        .map(|token| match token.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (token.to_string(), String::new()),
        })
        .collect();

    Some(Request { route, args })
}

/// Dispatch a request, folding routing errors into the response document
#[must_use]
pub fn respond(registry: &ExtensionRegistry, request: &Request) -> Value {
    match registry.dispatch(&request.route, &request.args) {
        Ok(val) => val,
        Err(e @ RegistryError::NotFound(_)) => json!({ "code": -404, "msg": e.to_string() }),
        Err(e @ RegistryError::HandlerPanicked { .. }) => {
            json!({ "code": kiln_abi::HANDLER_PANIC_CODE, "msg": e.to_string() })
        }
        Err(e) => json!({ "code": -400, "msg": e.to_string() }),
    }
}

/// Read lines from `reader` on a dedicated thread
///
/// The thread is detached: it never holds up runtime shutdown, even while
/// blocked in a read. It stops after end of input, a read error, or once the
/// receiver is dropped and the next line arrives.
///
/// # Errors
/// Returns an error if the thread cannot be spawned
pub fn spawn_line_reader<R>(reader: R) -> io::Result<mpsc::Receiver<io::Result<String>>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);

    thread::Builder::new()
        .name("kiln-request-reader".to_string())
        .spawn(move || {
            for line in reader.lines() {
                let failed = line.is_err();
                if tx.blocking_send(line).is_err() || failed {
                    break;
                }
            }
        })?;

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use std::time::{Duration, Instant};

    /// Blocks in `read` until the paired sender is dropped
    struct Stalled(std::sync::mpsc::Receiver<()>);

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[test]
    fn test_line_reader_delivers_lines_then_closes() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let lines = runtime.block_on(async {
            let mut rx = spawn_line_reader(Cursor::new("/a x=1\n\n/b\n")).unwrap();
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(line.unwrap());
            }
            lines
        });

        assert_eq!(lines, vec!["/a x=1", "", "/b"]);
    }

    #[test]
    fn test_blocked_reader_does_not_hold_shutdown() {
        let (release, stalled) = std::sync::mpsc::channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let waited = runtime.block_on(async {
            let mut rx = spawn_line_reader(io::BufReader::new(Stalled(stalled))).unwrap();
            tokio::time::timeout(Duration::from_millis(20), rx.recv()).await
        });
        assert!(waited.is_err());

        let started = Instant::now();
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(1));

        drop(release);
    }

    #[test]
    fn test_parse_request() {
        let request = parse_request("  /plugin/example/echo app=live stream=test flag ").unwrap();
        assert_eq!(request.route, "/plugin/example/echo");
        assert_eq!(request.args.get("app").map(String::as_str), Some("live"));
        assert_eq!(request.args.get("stream").map(String::as_str), Some("test"));
        assert_eq!(request.args.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_skips_blank_and_comments() {
        assert!(parse_request("").is_none());
        assert!(parse_request("   ").is_none());
        assert!(parse_request("# /index/api/version").is_none());
    }

    #[test]
    fn test_value_may_contain_equals() {
        let request = parse_request("/x url=rtmp://host/app?a=b").unwrap();
        assert_eq!(
            request.args.get("url").map(String::as_str),
            Some("rtmp://host/app?a=b")
        );
    }

    #[test]
    fn test_builtin_routes() {
        let registry = Arc::new(ExtensionRegistry::default());
        register_builtin_routes(&registry).unwrap();

        let list = respond(&registry, &parse_request(ROUTE_API_LIST).unwrap());
        assert_eq!(list["code"], 0);
        assert_eq!(list["data"], json!([ROUTE_API_LIST, ROUTE_VERSION]));

        let version = respond(&registry, &parse_request(ROUTE_VERSION).unwrap());
        assert_eq!(version["data"]["entry_symbol"], "zlm_plugin_init");
    }

    #[test]
    fn test_builtin_routes_twice_conflict() {
        let registry = Arc::new(ExtensionRegistry::default());
        register_builtin_routes(&registry).unwrap();
        assert!(register_builtin_routes(&registry).is_err());
    }

    #[test]
    fn test_unknown_route_response() {
        let registry = ExtensionRegistry::default();
        let val = respond(&registry, &parse_request("/nope").unwrap());
        assert_eq!(val["code"], -404);
    }
}
