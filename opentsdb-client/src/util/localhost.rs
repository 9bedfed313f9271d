use std::env;

/// The host and application a client reports data points as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Value of the injected `host` tag.
    pub host: String,

    /// Value of the injected `app` tag.
    pub app: String,
}

impl Identity {
    /// Resolves the identity of the running process.
    pub fn resolve() -> Self {
        Self { host: host_name(), app: app_name() }
    }
}

const FALLBACK_HOST: &str = "localhost";
const FALLBACK_APP: &str = "unknown";

/// Resolves the name of the local host.
///
/// The `HOSTNAME` and `COMPUTERNAME` environment variables are consulted first, followed by the operating system. If
/// nothing usable is found, `localhost` is returned.
pub fn host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .into_iter()
        .filter_map(|var| env::var(var).ok())
        .chain(os_host_name())
        .map(|name| sanitize(&name))
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_HOST.to_string())
}

/// Resolves the name of the running application from the current executable.
pub fn app_name() -> String {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .map(|name| sanitize(&name))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_APP.to_string())
}

/// Replaces every character that is not valid in a tag value with an underscore.
pub fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/') { c } else { '_' })
        .collect()
}

#[cfg(unix)]
fn os_host_name() -> Option<String> {
    let mut buf = [0u8; 256];

    // SAFETY: The buffer is valid for writes of its full length, and `gethostname` never writes past the given length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }

    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok()
}

#[cfg(not(unix))]
fn os_host_name() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::{app_name, host_name, sanitize, Identity};

    #[test]
    fn sanitized_names() {
        let cases = [
            ("web-01.example.com", "web-01.example.com"),
            ("  padded  ", "padded"),
            ("my app (2)", "my_app__2_"),
            ("ünïcode", "_n_code"),
            ("", ""),
        ];

        for (input, expected) in cases {
            assert_eq!(sanitize(input), expected);
        }
    }

    #[test]
    fn resolved_names_are_never_empty() {
        assert!(!host_name().is_empty());
        assert!(!app_name().is_empty());

        let identity = Identity::resolve();
        assert_eq!(identity.host, sanitize(&identity.host));
        assert_eq!(identity.app, sanitize(&identity.app));
    }
}
