//! Opening the authorization URL in the user's browser.

use std::process::Stdio;

use tokio::process::Command;

use super::errors::OAuthError;

/// Something that can show an authorization URL to the user.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> Result<(), OAuthError>;
}

/// Opens URLs with the platform's default handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> Result<(), OAuthError> {
        let (program, args) = opener(std::env::consts::OS, url);
        Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|e| OAuthError::Browser {
                reason: format!("{program}: {e}"),
            })
    }
}

/// Program and arguments that open `url` on `os`.
///
/// Windows goes through the URL protocol handler directly: `cmd /C start`
/// would split the query string at every `&`.
fn opener(os: &str, url: &str) -> (&'static str, Vec<String>) {
    match os {
        "macos" => ("open", vec![url.to_string()]),
        "windows" => (
            "rundll32",
            vec!["url.dll,FileProtocolHandler".to_string(), url.to_string()],
        ),
        _ => ("xdg-open", vec![url.to_string()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTH_URL: &str =
        "https://auth.example.com/authorize?response_type=code&client_id=c1&state=s%26t";

    #[test]
    fn test_windows_passes_query_intact() {
        let (program, args) = opener("windows", AUTH_URL);
        assert_eq!(program, "rundll32");
        assert_eq!(args, vec!["url.dll,FileProtocolHandler", AUTH_URL]);
    }

    #[test]
    fn test_unix_openers() {
        assert_eq!(opener("macos", AUTH_URL), ("open", vec![AUTH_URL.to_string()]));
        assert_eq!(opener("linux", AUTH_URL), ("xdg-open", vec![AUTH_URL.to_string()]));
    }
}
