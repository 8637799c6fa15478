//! Blocking wire protocol for the grading-server connection.
//!
//! Each cycle on a connection is a single request/response exchange driven
//! by the server:
//!
//! 1. Server sends a 4-byte big-endian control integer. Negative means
//!    keepalive and the cycle ends there. Non-negative is the problem id of
//!    a submission about to follow.
//! 2. Worker replies with a one-byte cache flag. Workers never cache
//!    problems, so the flag is always `false` and the server always sends
//!    the full problem data.
//! 3. Server sends three framed records: the problem, its test-case list,
//!    and the submitted program text.
//! 4. Worker grades the submission and sends back one framed result record.
//!
//! Framed records are a one-byte kind tag, a 4-byte big-endian payload
//! length, and a JSON payload. Any framing failure (unknown tag, kind
//! mismatch, oversized length, malformed JSON) is reported as
//! [`BuilderError::Protocol`], which the worker treats as a version
//! mismatch with the server rather than a transient fault.

use crate::config::types::{BuilderError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Upper bound on a single record payload. A submission is a problem
/// statement, test cases, and student program text; anything near this
/// size is a corrupt length field, not real data.
pub const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

/// Record kind tags on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Problem = 1,
    TestCaseList = 2,
    ProgramText = 3,
    SubmissionResult = 4,
}

impl RecordKind {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(RecordKind::Problem),
            2 => Ok(RecordKind::TestCaseList),
            3 => Ok(RecordKind::ProgramText),
            4 => Ok(RecordKind::SubmissionResult),
            other => Err(BuilderError::Protocol(format!(
                "unknown record tag {other}"
            ))),
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordKind::Problem => "problem",
            RecordKind::TestCaseList => "test-case-list",
            RecordKind::ProgramText => "program-text",
            RecordKind::SubmissionResult => "submission-result",
        };
        f.write_str(name)
    }
}

/// Read the per-cycle control integer sent by the server.
pub fn read_control<R: Read + ?Sized>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

pub fn write_control<W: Write + ?Sized>(w: &mut W, value: i32) -> Result<()> {
    w.write_all(&value.to_be_bytes())?;
    w.flush()?;
    Ok(())
}

/// Read a single-byte boolean. Only 0 and 1 are legal encodings.
pub fn read_flag<R: Read + ?Sized>(r: &mut R) -> Result<bool> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    match buf[0] {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(BuilderError::Protocol(format!(
            "invalid boolean byte {other:#04x}"
        ))),
    }
}

pub fn write_flag<W: Write + ?Sized>(w: &mut W, value: bool) -> Result<()> {
    w.write_all(&[u8::from(value)])?;
    w.flush()?;
    Ok(())
}

/// Read one framed record, requiring it to be of the expected kind.
pub fn read_record<T: DeserializeOwned, R: Read + ?Sized>(r: &mut R, expected: RecordKind) -> Result<T> {
    let mut header = [0u8; 5];
    r.read_exact(&mut header)?;
    let kind = RecordKind::from_tag(header[0])?;
    if kind != expected {
        return Err(BuilderError::Protocol(format!(
            "expected {expected} record, got {kind}"
        )));
    }
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_RECORD_LEN {
        return Err(BuilderError::Protocol(format!(
            "{kind} record length {len} exceeds limit {MAX_RECORD_LEN}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    serde_json::from_slice(&payload)
        .map_err(|e| BuilderError::Protocol(format!("malformed {kind} record: {e}")))
}

/// Write one framed record.
pub fn write_record<T: Serialize, W: Write + ?Sized>(w: &mut W, kind: RecordKind, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| BuilderError::Protocol(format!("cannot encode {kind} record: {e}")))?;
    if payload.len() > MAX_RECORD_LEN as usize {
        return Err(BuilderError::Protocol(format!(
            "{kind} record length {} exceeds limit {MAX_RECORD_LEN}",
            payload.len()
        )));
    }
    w.write_all(&[kind as u8])?;
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Problem, ProblemType};
    use std::io::Cursor;

    fn sample_problem() -> Problem {
        Problem {
            problem_id: 17,
            problem_type: ProblemType::CFunction,
            test_name: "addIntegers".to_string(),
            brief_description: "Add two integers".to_string(),
            schema_version: 1,
        }
    }

    #[test]
    fn control_integer_round_trips_big_endian() {
        let mut buf = Vec::new();
        write_control(&mut buf, 42).unwrap();
        assert_eq!(buf, [0, 0, 0, 42]);
        assert_eq!(read_control(&mut Cursor::new(&buf)).unwrap(), 42);

        let mut buf = Vec::new();
        write_control(&mut buf, -1).unwrap();
        assert_eq!(buf, [0xff, 0xff, 0xff, 0xff]);
        assert_eq!(read_control(&mut Cursor::new(&buf)).unwrap(), -1);
    }

    #[test]
    fn flag_rejects_bytes_other_than_zero_and_one() {
        assert!(!read_flag(&mut Cursor::new([0u8])).unwrap());
        assert!(read_flag(&mut Cursor::new([1u8])).unwrap());
        let err = read_flag(&mut Cursor::new([7u8])).unwrap_err();
        assert!(matches!(err, BuilderError::Protocol(_)));
    }

    #[test]
    fn record_round_trips() {
        let problem = sample_problem();
        let mut buf = Vec::new();
        write_record(&mut buf, RecordKind::Problem, &problem).unwrap();
        let back: Problem = read_record(&mut Cursor::new(&buf), RecordKind::Problem).unwrap();
        assert_eq!(back, problem);
    }

    #[test]
    fn kind_mismatch_is_a_protocol_error() {
        let mut buf = Vec::new();
        write_record(&mut buf, RecordKind::ProgramText, &"print(1)".to_string()).unwrap();
        let err = read_record::<Problem, _>(&mut Cursor::new(&buf), RecordKind::Problem).unwrap_err();
        assert!(matches!(err, BuilderError::Protocol(_)));
        assert!(err.is_worker_fatal());
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let buf = [0xee, 0, 0, 0, 0];
        let err =
            read_record::<Problem, _>(&mut Cursor::new(&buf), RecordKind::Problem).unwrap_err();
        assert!(matches!(err, BuilderError::Protocol(_)));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let mut buf = vec![RecordKind::Problem as u8];
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let err =
            read_record::<Problem, _>(&mut Cursor::new(&buf), RecordKind::Problem).unwrap_err();
        assert!(matches!(err, BuilderError::Protocol(_)));
    }

    #[test]
    fn malformed_json_payload_is_a_protocol_error() {
        let payload = b"{not json";
        let mut buf = vec![RecordKind::Problem as u8];
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        let err =
            read_record::<Problem, _>(&mut Cursor::new(&buf), RecordKind::Problem).unwrap_err();
        assert!(matches!(err, BuilderError::Protocol(_)));
    }

    #[test]
    fn truncated_stream_is_an_io_error_not_protocol() {
        let mut buf = Vec::new();
        write_record(&mut buf, RecordKind::Problem, &sample_problem()).unwrap();
        buf.truncate(buf.len() - 3);
        let err =
            read_record::<Problem, _>(&mut Cursor::new(&buf), RecordKind::Problem).unwrap_err();
        assert!(matches!(err, BuilderError::Io(_)));
        assert!(!err.is_worker_fatal());
    }
}
