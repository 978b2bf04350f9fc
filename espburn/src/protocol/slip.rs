//! SLIP-style framing used by the ROM and stub loaders.
//!
//! ## Frame Format
//!
//! ```text
//! +------+--------------------------------+------+
//! | 0xC0 |   payload (escaped)            | 0xC0 |
//! +------+--------------------------------+------+
//!
//!   0xC0 inside payload -> 0xDB 0xDC
//!   0xDB inside payload -> 0xDB 0xDD
//! ```
//!
//! Decoding is streaming: bytes arrive in arbitrary chunks from the serial
//! port, so [`PacketQueue`] keeps the partially received frame (including a
//! dangling escape byte) between calls.

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape introducer.
pub const ESC: u8 = 0xDB;
/// Escaped form of [`END`].
pub const ESC_END: u8 = 0xDC;
/// Escaped form of [`ESC`].
pub const ESC_ESC: u8 = 0xDD;

/// Encode a payload into a single delimited frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + payload.len() / 8 + 2);
    frame.push(END);
    escape_into(&mut frame, payload);
    frame.push(END);
    frame
}

fn escape_into(out: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            b => out.push(b),
        }
    }
}

/// Incremental frame decoder.
///
/// Owned exclusively by whoever reads the transport. Each [`push`](Self::push)
/// yields zero or more complete frames; an incomplete trailing frame is kept
/// for the next call.
#[derive(Debug, Default, Clone)]
pub struct PacketQueue {
    packet: Vec<u8>,
    in_frame: bool,
    escaped: bool,
}

impl PacketQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw transport bytes, returning every frame they complete.
    ///
    /// Bytes outside an open frame are discarded. A delimiter that would
    /// close an empty frame keeps the frame open instead, so back-to-back
    /// delimiters never yield an empty packet and a stray delimiter cannot
    /// desynchronize the stream.
    pub fn push(&mut self, incoming: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in incoming {
            if !self.in_frame {
                if byte == END {
                    self.in_frame = true;
                }
                continue;
            }

            if self.escaped {
                self.escaped = false;
                match byte {
                    ESC_END => self.packet.push(END),
                    ESC_ESC => self.packet.push(ESC),
                    END => {
                        // dangling escape right before a delimiter
                        self.close_into(&mut frames);
                    },
                    other => {
                        self.packet.push(ESC);
                        self.packet.push(other);
                    },
                }
                continue;
            }

            match byte {
                END => self.close_into(&mut frames),
                ESC => self.escaped = true,
                b => self.packet.push(b),
            }
        }

        frames
    }

    fn close_into(&mut self, frames: &mut Vec<Vec<u8>>) {
        if self.packet.is_empty() {
            return;
        }
        frames.push(std::mem::take(&mut self.packet));
        self.in_frame = false;
    }

    /// Re-escaped form of the retained partial frame.
    ///
    /// Starts with a delimiter so it can be fed back into a fresh queue
    /// unchanged. Empty when no frame is open.
    pub fn remaining(&self) -> Vec<u8> {
        if !self.in_frame {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.packet.len() + 2);
        out.push(END);
        escape_into(&mut out, &self.packet);
        if self.escaped {
            out.push(ESC);
        }
        out
    }

    /// Whether a partial frame is being held.
    pub fn is_empty(&self) -> bool {
        !self.in_frame && self.packet.is_empty()
    }

    /// Drop any partial frame.
    pub fn clear(&mut self) {
        self.packet.clear();
        self.in_frame = false;
        self.escaped = false;
    }
}

/// Functional form of [`PacketQueue::push`].
///
/// `queue` is a remainder previously returned by this function (or empty).
/// Returns the new remainder and the frames completed by `incoming`.
pub fn decode(queue: &[u8], incoming: &[u8]) -> (Vec<u8>, Vec<Vec<u8>>) {
    let mut decoder = PacketQueue::new();
    let mut frames = decoder.push(queue);
    frames.extend(decoder.push(incoming));
    (decoder.remaining(), frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_escapes_delimiter_and_escape() {
        assert_eq!(
            encode(&[0x01, END, 0x02, ESC, 0x03]),
            vec![END, 0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, 0x03, END]
        );
    }

    #[test]
    fn test_encode_empty_payload() {
        assert_eq!(encode(&[]), vec![END, END]);
    }

    #[test]
    fn test_decode_single_frame() {
        let (rest, frames) = decode(&[], &[0xC0, 0x00, 0x01, 0x02, 0x03, 0xC0]);
        assert_eq!(frames, vec![vec![0x00, 0x01, 0x02, 0x03]]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_decode_unescapes() {
        let (_, frames) = decode(&[], &[0xC0, 0xDB, 0xDC, 0x01, 0xC0]);
        assert_eq!(frames, vec![vec![0xC0, 0x01]]);
    }

    #[test]
    fn test_decode_partial_frame_carries_over() {
        let (rest, frames) = decode(&[], &[0xC0, 0x00, 0x01]);
        assert!(frames.is_empty());
        assert_eq!(rest, vec![0xC0, 0x00, 0x01]);

        let (rest, frames) = decode(&rest, &[0x02, 0xC0]);
        assert_eq!(frames, vec![vec![0x00, 0x01, 0x02]]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_decode_escape_split_across_calls() {
        let (rest, frames) = decode(&[], &[0xC0, 0x05, 0xDB]);
        assert!(frames.is_empty());
        assert_eq!(rest, vec![0xC0, 0x05, 0xDB]);

        let (rest, frames) = decode(&rest, &[0xDD, 0xC0]);
        assert_eq!(frames, vec![vec![0x05, 0xDB]]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_leading_noise_is_discarded() {
        let mut queue = PacketQueue::new();
        let frames = queue.push(&[0x11, 0x22, 0xC0, 0x33, 0xC0]);
        assert_eq!(frames, vec![vec![0x33]]);
    }

    #[test]
    fn test_back_to_back_delimiters_yield_nothing() {
        let mut queue = PacketQueue::new();
        let frames = queue.push(&[0xC0, 0xC0, 0xC0, 0x01, 0xC0, 0xC0, 0x02, 0xC0]);
        assert_eq!(frames, vec![vec![0x01], vec![0x02]]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_round_trip_whole_and_bytewise() {
        let payload: Vec<u8> = (0..=255u8).chain([END, ESC, END, ESC]).collect();
        let frame = encode(&payload);

        let mut whole = PacketQueue::new();
        assert_eq!(whole.push(&frame), vec![payload.clone()]);

        let mut bytewise = PacketQueue::new();
        let mut frames = Vec::new();
        for byte in &frame {
            frames.extend(bytewise.push(std::slice::from_ref(byte)));
        }
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn test_round_trip_every_split_point_through_remainder() {
        let payload = [0x00, ESC, END, 0x7F, ESC, ESC, END];
        let frame = encode(&payload);

        for split in 0..=frame.len() {
            let (rest, mut frames) = decode(&[], &frame[..split]);
            let (rest, more) = decode(&rest, &frame[split..]);
            frames.extend(more);
            assert_eq!(frames, vec![payload.to_vec()], "split at {split}");
            assert!(rest.is_empty(), "split at {split}");
        }
    }

    #[test]
    fn test_encoded_frame_has_no_raw_specials_inside() {
        let frame = encode(&[END, ESC, END]);
        let inner = &frame[1..frame.len() - 1];
        assert!(!inner.contains(&END));
        for pair in inner.windows(2) {
            if pair[0] == ESC {
                assert!(pair[1] == ESC_END || pair[1] == ESC_ESC);
            }
        }
    }

    #[test]
    fn test_consecutive_frames_in_one_read() {
        let mut stream = encode(&[0x01, 0x02]);
        stream.extend(encode(&[0x03]));
        let mut queue = PacketQueue::new();
        assert_eq!(queue.push(&stream), vec![vec![0x01, 0x02], vec![0x03]]);
    }
}
