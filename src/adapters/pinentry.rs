//! Interactive secret entry through a `pinentry` program.
//!
//! Speaks the small subset of the Assuan protocol that every pinentry
//! flavour understands: set a title, description and prompt, then `GETPIN`.

use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

use zeroize::Zeroizing;

use crate::domain::{Secret, Udi};
use crate::infra::error::{SessionError, SessionResult};
use crate::services::secret_source::SecretPrompt;

/// Default pinentry program, looked up on `PATH`.
pub const DEFAULT_PINENTRY: &str = "pinentry";

/// Assuan error code for a dialog the user cancelled.
const ASSUAN_CANCELED: &str = "83886179";

/// Prompts for the personalization secret with a pinentry dialog.
#[derive(Debug, Clone)]
pub struct PinentryPrompt {
    program: String,
}

impl PinentryPrompt {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for PinentryPrompt {
    fn default() -> Self {
        Self::new(DEFAULT_PINENTRY)
    }
}

impl SecretPrompt for PinentryPrompt {
    fn ask(&self, udi: &Udi) -> SessionResult<Secret> {
        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                SessionError::SecretAcquisitionFailed(format!(
                    "could not start {}: {e}",
                    self.program
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(SessionError::SecretAcquisitionFailed(
                "pinentry pipes unavailable".to_string(),
            ));
        };

        let description = format!(
            "Enter the phrase for the User-Supplied Secret (USS) of the TKey with UDI {udi}"
        );
        let result = converse(BufReader::new(stdout), stdin, &description, "USS:");

        // The dialog is done either way; reap the child.
        if let Err(e) = child.wait() {
            log::debug!("pinentry did not exit cleanly: {e}");
        }
        result
    }
}

/// Run one GETPIN conversation with a pinentry on `reader`/`writer`.
pub(crate) fn converse<R: BufRead, W: Write>(
    mut reader: R,
    mut writer: W,
    description: &str,
    prompt: &str,
) -> SessionResult<Secret> {
    expect_ok(&mut reader)?;
    for command in [
        format!("SETTITLE {}", escape("tkey-session")),
        format!("SETDESC {}", escape(description)),
        format!("SETPROMPT {}", escape(prompt)),
    ] {
        send(&mut writer, &command)?;
        expect_ok(&mut reader)?;
    }

    send(&mut writer, "GETPIN")?;
    let mut data = Zeroizing::new(Vec::new());
    loop {
        let line = Zeroizing::new(read_line(&mut reader)?);
        if let Some(payload) = line.strip_prefix("D ") {
            data.extend_from_slice(&unescape(payload)?);
        } else if *line == "OK" || line.starts_with("OK ") {
            break;
        } else if let Some(err) = line.strip_prefix("ERR ") {
            let _ = send(&mut writer, "BYE");
            if err.starts_with(ASSUAN_CANCELED) {
                return Err(SessionError::SecretAcquisitionFailed(
                    "secret entry cancelled".to_string(),
                ));
            }
            return Err(SessionError::SecretAcquisitionFailed(format!(
                "pinentry error: {err}"
            )));
        }
        // Status ("S ...") and comment ("# ...") lines carry nothing for us.
    }
    let _ = send(&mut writer, "BYE");

    if data.is_empty() {
        return Err(SessionError::SecretAcquisitionFailed(
            "empty secret entered".to_string(),
        ));
    }
    Ok(Secret::new(std::mem::take(&mut *data)))
}

fn send<W: Write>(writer: &mut W, command: &str) -> SessionResult<()> {
    writeln!(writer, "{command}")
        .and_then(|()| writer.flush())
        .map_err(|e| SessionError::SecretAcquisitionFailed(format!("pinentry write failed: {e}")))
}

fn read_line<R: BufRead>(reader: &mut R) -> SessionResult<String> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|e| SessionError::SecretAcquisitionFailed(format!("pinentry read failed: {e}")))?;
    if n == 0 {
        return Err(SessionError::SecretAcquisitionFailed(
            "pinentry closed the connection".to_string(),
        ));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn expect_ok<R: BufRead>(reader: &mut R) -> SessionResult<()> {
    loop {
        let line = read_line(reader)?;
        if line == "OK" || line.starts_with("OK ") {
            return Ok(());
        }
        if line.starts_with('#') || line.starts_with("S ") {
            continue;
        }
        return Err(SessionError::SecretAcquisitionFailed(format!(
            "unexpected pinentry response: {line}"
        )));
    }
}

/// Percent-escape the characters Assuan forbids in a command line.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => out.push_str("%25"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> SessionResult<Zeroizing<Vec<u8>>> {
    let bytes = text.as_bytes();
    let mut out = Zeroizing::new(Vec::with_capacity(bytes.len()));
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3).ok_or_else(|| {
                SessionError::SecretAcquisitionFailed("truncated escape in pinentry data".into())
            })?;
            let decoded = std::str::from_utf8(hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    SessionError::SecretAcquisitionFailed("bad escape in pinentry data".into())
                })?;
            out.push(decoded);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}
