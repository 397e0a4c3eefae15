//! Wire protocol between driver and stub.
//!
//! Two unidirectional pipes carry a minimal byte protocol. The driver sends
//! single-byte step requests on the control pipe. The stub answers on the
//! info pipe with a 4-byte big-endian slave pid once at startup, then a
//! stream of fixed-width event records. Every record starts with a tag byte
//! that determines its length and no record exceeds three bytes, so the
//! stream is self-framing and survives arbitrary read fragmentation.

/// Control pipe: request one synchronization cycle.
pub const STEP_REQUEST: u8 = b's';

/// Info pipe: slave observed blocked on terminal input, input buffer empty.
pub const TAG_READY: u8 = b'r';

/// Info pipe: slave exited or was signalled; two status bytes follow.
pub const TAG_DIED: u8 = b'd';

pub const PID_HANDSHAKE_LEN: usize = 4;
const DIED_RECORD_LEN: usize = 3;

pub fn encode_pid(pid: i32) -> [u8; PID_HANDSHAKE_LEN] {
    (pid as u32).to_be_bytes()
}

pub fn decode_pid(bytes: [u8; PID_HANDSHAKE_LEN]) -> i32 {
    u32::from_be_bytes(bytes) as i32
}

pub fn ready_record() -> [u8; 1] {
    [TAG_READY]
}

/// `signal` is 0 when the slave exited normally; `status` is 0 when it was
/// signalled.
pub fn died_record(signal: u8, status: u8) -> [u8; DIED_RECORD_LEN] {
    [TAG_DIED, signal, status]
}

/// One decoded event from the info pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoEvent {
    Ready,
    Died { signal: u8, status: u8 },
}

/// Incremental decoder for the info pipe.
///
/// Feed it whatever `read` returned; it buffers at most a partial `died`
/// record between calls.
#[derive(Debug, Default)]
pub struct InfoDecoder {
    pending: Vec<u8>,
}

impl InfoDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes`, appending completed events to `out`.
    ///
    /// An unknown tag byte is unrecoverable (the stream has no way to
    /// resynchronize) and is returned as `Err` with the offending byte.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<InfoEvent>) -> Result<(), u8> {
        self.pending.extend_from_slice(bytes);
        loop {
            match self.pending.first() {
                None => return Ok(()),
                Some(&TAG_READY) => {
                    self.pending.remove(0);
                    out.push(InfoEvent::Ready);
                }
                Some(&TAG_DIED) => {
                    if self.pending.len() < DIED_RECORD_LEN {
                        return Ok(());
                    }
                    let signal = self.pending[1];
                    let status = self.pending[2];
                    self.pending.drain(..DIED_RECORD_LEN);
                    out.push(InfoEvent::Died { signal, status });
                }
                Some(&tag) => return Err(tag),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut InfoDecoder, bytes: &[u8]) -> Vec<InfoEvent> {
        let mut out = Vec::new();
        decoder.feed(bytes, &mut out).expect("well-formed stream");
        out
    }

    #[test]
    fn pid_handshake_round_trips() {
        for pid in [1, 4096, 70_000, i32::MAX] {
            assert_eq!(decode_pid(encode_pid(pid)), pid);
        }
    }

    #[test]
    fn decodes_ready_and_died_records() {
        let mut decoder = InfoDecoder::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(&ready_record());
        stream.extend_from_slice(&died_record(0, 2));

        let events = decode_all(&mut decoder, &stream);
        assert_eq!(
            events,
            vec![
                InfoEvent::Ready,
                InfoEvent::Died {
                    signal: 0,
                    status: 2
                }
            ]
        );
    }

    #[test]
    fn tolerates_partial_died_record() {
        let mut decoder = InfoDecoder::new();
        let record = died_record(15, 0);

        assert!(decode_all(&mut decoder, &record[..1]).is_empty());
        assert!(decode_all(&mut decoder, &record[1..2]).is_empty());
        assert_eq!(
            decode_all(&mut decoder, &record[2..]),
            vec![InfoEvent::Died {
                signal: 15,
                status: 0
            }]
        );
    }

    #[test]
    fn tolerates_ready_split_around_died() {
        let mut decoder = InfoDecoder::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(&died_record(9, 0));
        stream.extend_from_slice(&ready_record());

        let first = decode_all(&mut decoder, &stream[..2]);
        assert!(first.is_empty());
        let rest = decode_all(&mut decoder, &stream[2..]);
        assert_eq!(
            rest,
            vec![InfoEvent::Died { signal: 9, status: 0 }, InfoEvent::Ready]
        );
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut decoder = InfoDecoder::new();
        let mut out = Vec::new();
        assert_eq!(decoder.feed(b"x", &mut out), Err(b'x'));
    }
}
