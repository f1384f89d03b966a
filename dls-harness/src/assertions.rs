//! Content checks on downloaded files.

use std::io::Read;

use crate::error::{HarnessError, HarnessResult};

const FIRST_CHUNK: usize = 1024;

/// Read the first chunk (up to 1 KiB) of `reader` as text.
///
/// Fails when the stream is empty. Invalid UTF-8 is replaced.
pub fn read_stream(mut reader: impl Read) -> HarnessResult<String> {
    let mut buffer = [0u8; FIRST_CHUNK];
    let length = loop {
        match reader.read(&mut buffer) {
            Ok(length) => break length,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    };
    if length == 0 {
        return Err(HarnessError::AssertionFailed(
            "failed to read anything from input stream".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&buffer[..length]).into_owned())
}

/// Panic unless `actual` begins with the literal `expected_prefix`.
#[track_caller]
pub fn assert_starts_with(expected_prefix: &str, actual: &str) {
    assert!(
        actual.starts_with(expected_prefix),
        "expected {actual:?} to start with {expected_prefix:?}"
    );
}
