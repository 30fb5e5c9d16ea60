use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::{
    BrokerError, CredentialBroker, CredentialRequest, CredentialResponse, MAX_CREDENTIAL_REF_LEN,
};

pub const COMMAND_ALLOWLIST_ENV: &str = "TOLLGATE_CREDENTIAL_COMMAND_ALLOWLIST";
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// Runs an allow-listed local command that reads the request as JSON on
/// stdin and prints a credential response on stdout.
///
/// Captured output never appears in errors.
#[derive(Debug, Clone)]
pub struct CommandBroker {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandBroker {
    /// `allowlist` is a comma-separated list of full paths or basenames.
    pub fn new(command: &str, args: Vec<String>, allowlist: &str) -> Result<Self, BrokerError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(BrokerError::Config("command broker requires a command".into()));
        }
        if command.chars().any(char::is_whitespace) {
            return Err(BrokerError::Config(
                "command broker command must not contain whitespace".into(),
            ));
        }
        if !is_allowed(command, allowlist) {
            return Err(BrokerError::Config(format!(
                "command {command} is not listed in {COMMAND_ALLOWLIST_ENV}"
            )));
        }
        Ok(CommandBroker {
            command: command.to_string(),
            args: args
                .into_iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, payload: &[u8]) -> Result<Vec<u8>, BrokerError> {
        let failed = |status: String| BrokerError::CommandFailed {
            command: self.command.clone(),
            status,
        };
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| failed(format!("spawn error ({})", e.kind())))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that exits without reading stdin is judged by its
            // exit status, not by the broken pipe.
            let _ = stdin.write_all(payload);
        }
        let reader = child.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stdout
                    .by_ref()
                    .take(MAX_OUTPUT_BYTES as u64 + 1)
                    .read_to_end(&mut buf);
                // Discard the excess so the command never blocks on a full pipe.
                let _ = io::copy(&mut stdout, &mut io::sink());
                buf
            })
        });

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BrokerError::CommandTimeout {
                    command: self.command.clone(),
                    timeout: self.timeout,
                });
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(failed(format!("wait error ({})", e.kind())));
            }
        };
        let output = reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(failed(status.to_string()));
        }
        if output.len() > MAX_OUTPUT_BYTES {
            return Err(BrokerError::OutputTooLarge {
                command: self.command.clone(),
                limit: MAX_OUTPUT_BYTES,
            });
        }
        Ok(output)
    }

    fn invalid(&self, reason: &str) -> BrokerError {
        BrokerError::InvalidResponse {
            broker: format!("command {}", self.command),
            reason: reason.to_string(),
        }
    }
}

impl CredentialBroker for CommandBroker {
    fn name(&self) -> &str {
        "command"
    }

    fn issue(&self, request: &CredentialRequest) -> Result<CredentialResponse, BrokerError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| BrokerError::InvalidRequest(format!("encode request: {e}")))?;
        let output = self.run(&payload)?;
        let text = String::from_utf8_lossy(&output);
        let text = text.trim();
        if text.is_empty() {
            return Err(self.invalid("empty output"));
        }

        let mut response = match serde_json::from_str::<CredentialResponse>(text) {
            Ok(response) => response,
            Err(_) => CredentialResponse {
                credential_ref: text.to_string(),
                ..CredentialResponse::default()
            },
        };
        response.credential_ref = response.credential_ref.trim().to_string();
        if response.credential_ref.is_empty() {
            return Err(self.invalid("empty credential_ref"));
        }
        if response.credential_ref.len() > MAX_CREDENTIAL_REF_LEN {
            return Err(self.invalid("credential_ref too long"));
        }
        if response
            .credential_ref
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(self.invalid("credential_ref contains whitespace or control characters"));
        }
        if response.issued_by.trim().is_empty() {
            response.issued_by = self.name().to_string();
        }
        Ok(response)
    }
}

fn is_allowed(command: &str, allowlist: &str) -> bool {
    let base = Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(command);
    allowlist
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .any(|entry| entry == command || entry == base)
}

/// Adds `wait_timeout` to `Child`.
trait ChildExt {
    fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<ExitStatus>>;
}

impl ChildExt for Child {
    fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
        let start = Instant::now();
        let poll_interval = Duration::from_millis(10);
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowlist_matches_path_or_basename() {
        assert!(is_allowed("/usr/local/bin/issue-cred", "issue-cred"));
        assert!(is_allowed("/usr/local/bin/issue-cred", "other, /usr/local/bin/issue-cred"));
        assert!(!is_allowed("/usr/local/bin/issue-cred", "issue"));
        assert!(!is_allowed("issue-cred", ""));
    }

    #[test]
    fn test_construction_rules() {
        assert!(matches!(
            CommandBroker::new("", vec![], "x"),
            Err(BrokerError::Config(_))
        ));
        assert!(matches!(
            CommandBroker::new("echo hi", vec![], "echo hi"),
            Err(BrokerError::Config(_))
        ));
        let err = CommandBroker::new("cat", vec![], "").unwrap_err();
        assert!(err.to_string().contains(COMMAND_ALLOWLIST_ENV));
        let broker = CommandBroker::new("cat", vec![" ".into(), "-u".into()], "cat").unwrap();
        assert_eq!(broker.args, vec!["-u"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_echoing_command_returns_request_as_raw_reference() {
        // `cat` echoes the request JSON, which is not a credential response
        // and contains no whitespace, so it is taken as the raw reference.
        let broker = CommandBroker::new("cat", vec![], "cat").unwrap();
        let request = CredentialRequest {
            tool_name: "tool.write".into(),
            identity: "alice".into(),
            ..CredentialRequest::default()
        };
        let response = broker.issue(&request).unwrap();
        assert!(response.credential_ref.starts_with("{\"tool_name\""));
        assert_eq!(response.issued_by, "command");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_command_reports_status_only() {
        let broker = CommandBroker::new("false", vec![], "false").unwrap();
        let err = broker.issue(&CredentialRequest::default()).unwrap_err();
        assert_eq!(err.code(), "credential_command_failed");
        assert!(err.to_string().starts_with("credential command false exited with"));
    }

    #[cfg(unix)]
    #[test]
    fn test_oversized_output_is_reported_as_too_large() {
        // Well past the pipe buffer, so the command only finishes if stdout
        // keeps being drained.
        let args = vec!["-c".into(), "1048576".into(), "/dev/zero".into()];
        let broker = CommandBroker::new("head", args, "head")
            .unwrap()
            .with_timeout(Duration::from_secs(5));
        let err = broker.issue(&CredentialRequest::default()).unwrap_err();
        assert_eq!(err.code(), "credential_command_output_too_large");
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_command_times_out() {
        let broker = CommandBroker::new("sleep", vec!["5".into()], "sleep")
            .unwrap()
            .with_timeout(Duration::from_millis(100));
        let err = broker.issue(&CredentialRequest::default()).unwrap_err();
        assert_eq!(err.code(), "credential_command_timeout");
    }
}
