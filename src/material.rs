//! Key material acquisition.
//!
//! Material comes from one of two places: the interactive prompt (standard
//! input) or a file named by a `file://` keylocation. Both go through the
//! same byte reader so that length limits and newline handling agree:
//!
//! - raw keys are read as up to 33 bytes with no line parsing, since raw
//!   material may legitimately contain `\n`;
//! - hex keys and passphrases are read as a single line;
//! - one trailing newline, if present, is stripped.
//!
//! All buffers holding material are [`SecretBytes`] and are wiped on drop.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, IsTerminal, Read, Write};
use std::path::Path;

use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::WRAPPING_KEY_LEN;
use crate::error::KeyError;
use crate::props::{KeyFormat, KeyLocation};
use crate::tty::CancelToken;

/// Shortest accepted passphrase, in bytes.
pub const MIN_PASSPHRASE_LEN: usize = 8;

/// Longest accepted passphrase, in bytes.
pub const MAX_PASSPHRASE_LEN: usize = 64;

/// One byte more than a raw key, so over-long files are detectable.
const RAW_READ_LIMIT: usize = WRAPPING_KEY_LEN + 1;

/// Upper bound for a single line of hex or passphrase material.
const LINE_READ_LIMIT: usize = 1024;

/// Heap buffer that is zeroised on drop.
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// How a single entry is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Up to 33 bytes, newlines included.
    Raw,
    /// One line.
    Line,
}

impl ReadMode {
    pub fn for_format(format: KeyFormat) -> Self {
        match format {
            KeyFormat::Raw => Self::Raw,
            _ => Self::Line,
        }
    }
}

/// A stream key material can be read from.
pub trait KeyInput {
    /// True when a human is typing, which enables confirmation and retry.
    fn is_interactive(&self) -> bool;

    /// Read one entry. `prompt` is only shown by interactive inputs.
    fn read_entry(
        &mut self,
        prompt: &str,
        mode: ReadMode,
        cancel: &CancelToken,
    ) -> Result<SecretBytes, KeyError>;
}

/// Read one entry from `reader`.
///
/// `interrupted` is polled whenever the read returns `EINTR`; a pending
/// interrupt or a cancelled token ends the read with
/// [`KeyError::Interrupted`]. Any other `EINTR` is retried.
///
/// A line longer than the read limit is consumed through its newline and
/// rejected, so the next read starts at the next line.
pub fn read_material<R: Read + ?Sized>(
    reader: &mut R,
    mode: ReadMode,
    cancel: &CancelToken,
    interrupted: &dyn Fn() -> bool,
) -> Result<SecretBytes, KeyError> {
    let limit = match mode {
        ReadMode::Raw => RAW_READ_LIMIT,
        ReadMode::Line => LINE_READ_LIMIT,
    };

    // Capacity is never exceeded, so the buffer is never reallocated and
    // no unwiped copy is left behind.
    let mut buf = Zeroizing::new(Vec::with_capacity(limit));
    let mut line_ended = false;

    while buf.len() < limit {
        match next_byte(reader, cancel, interrupted)? {
            None => {
                line_ended = true;
                break;
            }
            Some(b'\n') if mode == ReadMode::Line => {
                buf.push(b'\n');
                line_ended = true;
                break;
            }
            Some(byte) => buf.push(byte),
        }
    }

    if mode == ReadMode::Line && !line_ended {
        while let Some(byte) = next_byte(reader, cancel, interrupted)? {
            if byte == b'\n' {
                break;
            }
        }
        return Err(KeyError::InputValidation(format!(
            "key material too long (max {LINE_READ_LIMIT} bytes per line)"
        )));
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
    }

    Ok(buf)
}

/// Next byte of `reader`, or `None` at end of input.
fn next_byte<R: Read + ?Sized>(
    reader: &mut R,
    cancel: &CancelToken,
    interrupted: &dyn Fn() -> bool,
) -> Result<Option<u8>, KeyError> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                let value = byte[0];
                byte.zeroize();
                return Ok(Some(value));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if interrupted() || cancel.is_cancelled() {
                    return Err(KeyError::Interrupted);
                }
            }
            Err(e) => {
                return Err(KeyError::MaterialAcquisition(format!("read failed: {e}")));
            }
        }
    }
}

/// Format-specific checks performed right after reading.
pub fn validate_material(format: KeyFormat, material: &[u8]) -> Result<(), KeyError> {
    let len = material.len();
    match format {
        KeyFormat::Raw => {
            if len < WRAPPING_KEY_LEN {
                return Err(KeyError::InputValidation(format!(
                    "raw key too short (expected {WRAPPING_KEY_LEN})"
                )));
            }
            if len > WRAPPING_KEY_LEN {
                return Err(KeyError::InputValidation(format!(
                    "raw key too long (expected {WRAPPING_KEY_LEN})"
                )));
            }
        }
        KeyFormat::Hex => {
            let expected = WRAPPING_KEY_LEN * 2;
            if len < expected {
                return Err(KeyError::InputValidation(format!(
                    "hex key too short (expected {expected})"
                )));
            }
            if len > expected {
                return Err(KeyError::InputValidation(format!(
                    "hex key too long (expected {expected})"
                )));
            }
            if !material.iter().all(u8::is_ascii_hexdigit) {
                return Err(KeyError::InputValidation("invalid hex character detected".into()));
            }
        }
        KeyFormat::Passphrase => {
            if len > MAX_PASSPHRASE_LEN {
                return Err(KeyError::InputValidation(format!(
                    "passphrase too long (max {MAX_PASSPHRASE_LEN})"
                )));
            }
            if len < MIN_PASSPHRASE_LEN {
                return Err(KeyError::InputValidation(format!(
                    "passphrase too short (min {MIN_PASSPHRASE_LEN})"
                )));
            }
        }
        KeyFormat::None => {
            return Err(KeyError::PolicyViolation("keyformat required".into()));
        }
    }
    Ok(())
}

/// What the material is for; drives the prompt wording and confirmation.
#[derive(Debug, Clone, Copy)]
pub struct AcquireContext<'a> {
    /// Dataset named in the prompt.
    pub dataset: &'a str,
    /// Ask a second time and require identical input.
    pub confirm: bool,
    /// The key is being set rather than checked.
    pub new_key: bool,
}

pub(crate) fn prompt_text(format: KeyFormat, ctx: &AcquireContext<'_>, again: bool) -> String {
    format!(
        "{} {}{} for '{}': ",
        if again { "Re-enter" } else { "Enter" },
        if ctx.new_key { "new " } else { "" },
        format.prompt_label(),
        ctx.dataset
    )
}

/// Validated material plus whether the caller may ask for it again.
pub struct KeyMaterial {
    pub bytes: SecretBytes,
    pub can_retry: bool,
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Standard input. Interactive iff it is a terminal.
#[derive(Debug, Default)]
pub struct StdinInput;

impl KeyInput for StdinInput {
    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal()
    }

    fn read_entry(
        &mut self,
        prompt: &str,
        mode: ReadMode,
        cancel: &CancelToken,
    ) -> Result<SecretBytes, KeyError> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return read_material(&mut stdin.lock(), mode, cancel, &|| false);
        }
        read_from_terminal(&stdin, prompt, mode, cancel)
    }
}

#[cfg(unix)]
fn read_from_terminal(
    stdin: &io::Stdin,
    prompt: &str,
    mode: ReadMode,
    cancel: &CancelToken,
) -> Result<SecretBytes, KeyError> {
    use std::os::fd::AsRawFd;

    use crate::tty::TerminalGuard;

    let mut stdout = io::stdout();
    write!(stdout, "{prompt}")
        .and_then(|()| stdout.flush())
        .map_err(|e| KeyError::MaterialAcquisition(format!("failed to write prompt: {e}")))?;

    let result = {
        let guard = TerminalGuard::engage(stdin.as_raw_fd(), cancel.clone()).map_err(|e| {
            KeyError::MaterialAcquisition(format!("failed to disable terminal echo: {e}"))
        })?;
        read_material(&mut stdin.lock(), mode, cancel, &|| guard.interrupted())
    };

    // The newline the user typed was not echoed.
    let _ = writeln!(stdout);
    result
}

#[cfg(not(unix))]
fn read_from_terminal(
    stdin: &io::Stdin,
    prompt: &str,
    mode: ReadMode,
    cancel: &CancelToken,
) -> Result<SecretBytes, KeyError> {
    let mut stdout = io::stdout();
    let _ = write!(stdout, "{prompt}").and_then(|()| stdout.flush());
    read_material(&mut stdin.lock(), mode, cancel, &|| false)
}

/// A key file, opened read-only. Never interactive.
pub struct FileInput {
    reader: BufReader<File>,
}

impl FileInput {
    pub fn open(path: &Path) -> Result<Self, KeyError> {
        let file = File::open(path).map_err(|e| {
            KeyError::MaterialAcquisition(format!(
                "failed to open key material file '{}': {e}",
                path.display()
            ))
        })?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }
}

impl KeyInput for FileInput {
    fn is_interactive(&self) -> bool {
        false
    }

    fn read_entry(
        &mut self,
        _prompt: &str,
        mode: ReadMode,
        cancel: &CancelToken,
    ) -> Result<SecretBytes, KeyError> {
        read_material(&mut self.reader, mode, cancel, &|| false)
    }
}

/// Pre-recorded entries, replayed one per read.
///
/// Stands in for a person at a terminal (or a pipe, when built with
/// `interactive = false`) when driving key entry programmatically.
#[derive(Default)]
pub struct ScriptedInput {
    entries: VecDeque<SecretBytes>,
    interactive: bool,
}

impl ScriptedInput {
    /// An input that behaves like a terminal.
    pub fn interactive<I, E>(entries: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: AsRef<[u8]>,
    {
        Self {
            entries: collect_entries(entries),
            interactive: true,
        }
    }

    /// An input that behaves like a pipe.
    pub fn piped<I, E>(entries: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: AsRef<[u8]>,
    {
        Self {
            entries: collect_entries(entries),
            interactive: false,
        }
    }

    /// Entries not yet consumed.
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }
}

fn collect_entries<I, E>(entries: I) -> VecDeque<SecretBytes>
where
    I: IntoIterator<Item = E>,
    E: AsRef<[u8]>,
{
    entries
        .into_iter()
        .map(|e| Zeroizing::new(e.as_ref().to_vec()))
        .collect()
}

impl KeyInput for ScriptedInput {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn read_entry(
        &mut self,
        _prompt: &str,
        mode: ReadMode,
        cancel: &CancelToken,
    ) -> Result<SecretBytes, KeyError> {
        let entry = self
            .entries
            .pop_front()
            .ok_or_else(|| KeyError::MaterialAcquisition("no key material provided".into()))?;
        read_material(&mut entry.as_slice(), mode, cancel, &|| false)
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Resolves a keylocation to an input and acquires validated material.
pub struct KeySource {
    prompt: Box<dyn KeyInput>,
    cancel: CancelToken,
}

impl Default for KeySource {
    fn default() -> Self {
        Self::stdin()
    }
}

impl KeySource {
    /// Prompt on the process's standard input.
    pub fn stdin() -> Self {
        Self::with_prompt(StdinInput)
    }

    /// Use `input` for the `prompt` keylocation.
    pub fn with_prompt(input: impl KeyInput + 'static) -> Self {
        Self {
            prompt: Box::new(input),
            cancel: CancelToken::new(),
        }
    }

    /// Token tripped when key entry is interrupted.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// True when material for `location` is typed by a person.
    pub fn is_interactive(&self, location: &KeyLocation) -> bool {
        matches!(location, KeyLocation::Prompt) && self.prompt.is_interactive()
    }

    /// Fetch and validate key material.
    pub fn acquire(
        &mut self,
        location: &KeyLocation,
        format: KeyFormat,
        ctx: &AcquireContext<'_>,
    ) -> Result<KeyMaterial, KeyError> {
        debug!(dataset = ctx.dataset, %location, %format, "acquiring key material");

        let mut file_input;
        let input: &mut dyn KeyInput = match location {
            KeyLocation::Prompt => {
                if format == KeyFormat::Raw && self.prompt.is_interactive() {
                    return Err(KeyError::PolicyViolation(
                        "cannot enter raw keys on the terminal".into(),
                    ));
                }
                self.prompt.as_mut()
            }
            KeyLocation::File(path) => {
                file_input = FileInput::open(path)?;
                &mut file_input
            }
            KeyLocation::None => {
                return Err(KeyError::PolicyViolation("invalid keylocation 'none'".into()));
            }
        };

        let interactive = input.is_interactive();
        let mode = ReadMode::for_format(format);
        self.cancel.reset();

        let first = input.read_entry(&prompt_text(format, ctx, false), mode, &self.cancel)?;
        validate_material(format, &first)?;

        if ctx.confirm && interactive {
            let second = input.read_entry(&prompt_text(format, ctx, true), mode, &self.cancel)?;
            // Equal to a validated entry means valid; only equality is checked.
            // Both entries come from the same person, so timing reveals nothing.
            if first[..] != second[..] {
                return Err(KeyError::MaterialAcquisition("provided keys do not match".into()));
            }
        }

        Ok(KeyMaterial {
            bytes: first,
            can_retry: interactive,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;

    use super::*;
    use crate::error::ErrorKind;

    const PASS: &str = "correct horse";

    fn read(bytes: &[u8], mode: ReadMode) -> SecretBytes {
        let cancel = CancelToken::new();
        read_material(&mut Cursor::new(bytes), mode, &cancel, &|| false).unwrap()
    }

    fn ctx(confirm: bool) -> AcquireContext<'static> {
        AcquireContext {
            dataset: "tank/home",
            confirm,
            new_key: false,
        }
    }

    #[test]
    fn line_mode_stops_at_newline_and_strips_it() {
        let line = |bytes: &[u8]| read(bytes, ReadMode::Line);
        assert_eq!(&line(b"hunter22\nleftover")[..], b"hunter22");
        assert_eq!(&line(b"no newline")[..], b"no newline");
    }

    #[test]
    fn only_one_trailing_newline_is_stripped() {
        let mut material = vec![b'a'; 31];
        material.extend_from_slice(b"\n\n");
        let got = read(&material, ReadMode::Raw);
        assert_eq!(got.len(), 32);
        assert_eq!(got[31], b'\n');
    }

    #[test]
    fn raw_mode_reads_through_newlines_up_to_33_bytes() {
        let mut material = vec![b'\n'; 10];
        material.extend(std::iter::repeat(7u8).take(40));
        let got = read(&material, ReadMode::Raw);
        assert_eq!(got.len(), RAW_READ_LIMIT);
        assert_eq!(&got[..10], &[b'\n'; 10]);
    }

    #[test]
    fn interrupted_read_reports_interrupt() {
        struct Eintr;
        impl Read for Eintr {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            }
        }

        let err = read_material(&mut Eintr, ReadMode::Line, &CancelToken::new(), &|| true)
            .err()
            .unwrap();
        assert!(matches!(err, KeyError::Interrupted));
        assert!(!err.is_correctable());
    }

    #[test]
    fn over_long_line_is_rejected_and_consumed() {
        let mut stream = vec![b'a'; LINE_READ_LIMIT + 100];
        stream.extend_from_slice(b"tailpass1\nnext entry\n");
        let mut reader = Cursor::new(stream);
        let cancel = CancelToken::new();
        let mut read_line = || read_material(&mut reader, ReadMode::Line, &cancel, &|| false);

        let err = read_line().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InputValidation);
        assert!(err.is_correctable());

        // The rejected line's tail is not replayed as a new entry.
        assert_eq!(&read_line().unwrap()[..], b"next entry");
        assert!(read_line().unwrap().is_empty());
    }

    #[test]
    fn line_at_exact_limit_without_newline_is_rejected() {
        let mut reader = Cursor::new(vec![b'a'; LINE_READ_LIMIT]);
        let result = read_material(&mut reader, ReadMode::Line, &CancelToken::new(), &|| false);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InputValidation);

        let mut line = vec![b'a'; LINE_READ_LIMIT - 1];
        line.push(b'\n');
        assert_eq!(read(&line, ReadMode::Line).len(), LINE_READ_LIMIT - 1);
    }

    #[test]
    fn passphrase_bounds() {
        assert!(validate_material(KeyFormat::Passphrase, &[b'x'; 7]).is_err());
        assert!(validate_material(KeyFormat::Passphrase, &[b'x'; 8]).is_ok());
        assert!(validate_material(KeyFormat::Passphrase, &[b'x'; 64]).is_ok());
        assert!(validate_material(KeyFormat::Passphrase, &[b'x'; 65]).is_err());
    }

    #[test]
    fn raw_and_hex_lengths() {
        assert!(validate_material(KeyFormat::Raw, &[0u8; 32]).is_ok());
        assert!(validate_material(KeyFormat::Raw, &[0u8; 31]).is_err());
        assert!(validate_material(KeyFormat::Raw, &[0u8; 33]).is_err());

        assert!(validate_material(KeyFormat::Hex, &[b'a'; 64]).is_ok());
        assert!(validate_material(KeyFormat::Hex, &[b'a'; 63]).is_err());
        let mut bad = [b'a'; 64];
        bad[10] = b'z';
        let err = validate_material(KeyFormat::Hex, &bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InputValidation);
    }

    #[test]
    fn prompt_wording() {
        let context = AcquireContext {
            dataset: "tank/a",
            confirm: true,
            new_key: true,
        };
        assert_eq!(
            prompt_text(KeyFormat::Passphrase, &context, true),
            "Re-enter new passphrase for 'tank/a': "
        );
        assert_eq!(
            prompt_text(KeyFormat::Hex, &ctx(false), false),
            "Enter hex key for 'tank/home': "
        );
    }

    #[test]
    fn interactive_confirmation_must_match() {
        let mut source = KeySource::with_prompt(ScriptedInput::interactive([PASS, "different!"]));
        let err = source
            .acquire(&KeyLocation::Prompt, KeyFormat::Passphrase, &ctx(true))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::MaterialAcquisition);

        let mut source = KeySource::with_prompt(ScriptedInput::interactive([PASS, PASS]));
        let material = source
            .acquire(&KeyLocation::Prompt, KeyFormat::Passphrase, &ctx(true))
            .unwrap();
        assert_eq!(&material.bytes[..], PASS.as_bytes());
        assert!(material.can_retry);
    }

    #[test]
    fn piped_prompt_skips_confirmation_and_retry() {
        let mut source = KeySource::with_prompt(ScriptedInput::piped([PASS]));
        let material = source
            .acquire(&KeyLocation::Prompt, KeyFormat::Passphrase, &ctx(true))
            .unwrap();
        assert!(!material.can_retry);
    }

    #[test]
    fn raw_keys_rejected_on_terminal_only() {
        let raw = [9u8; 32];
        let mut source = KeySource::with_prompt(ScriptedInput::interactive([raw]));
        let err = source
            .acquire(&KeyLocation::Prompt, KeyFormat::Raw, &ctx(false))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);

        let mut source = KeySource::with_prompt(ScriptedInput::piped([raw]));
        let material = source
            .acquire(&KeyLocation::Prompt, KeyFormat::Raw, &ctx(false))
            .unwrap();
        assert_eq!(&material.bytes[..], &raw);
    }

    #[test]
    fn file_location_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{PASS}").unwrap();
        let location = KeyLocation::File(file.path().to_path_buf());

        let mut source = KeySource::with_prompt(ScriptedInput::interactive(Vec::<&str>::new()));
        let material = source
            .acquire(&location, KeyFormat::Passphrase, &ctx(true))
            .unwrap();
        assert_eq!(&material.bytes[..], PASS.as_bytes());
        assert!(!material.can_retry);
        assert!(!source.is_interactive(&location));
    }

    #[test]
    fn missing_file_is_acquisition_failure() {
        let location = KeyLocation::File(PathBuf::from("/nonexistent/keyroot/key"));
        let mut source = KeySource::with_prompt(ScriptedInput::piped(Vec::<&str>::new()));
        let err = source
            .acquire(&location, KeyFormat::Hex, &ctx(false))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::MaterialAcquisition);
    }

    #[test]
    fn none_location_is_rejected() {
        let mut source = KeySource::with_prompt(ScriptedInput::piped([PASS]));
        let err = source
            .acquire(&KeyLocation::None, KeyFormat::Passphrase, &ctx(false))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
    }
}
