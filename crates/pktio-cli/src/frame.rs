//! Test traffic: every frame starts with its sequence number and repeats its
//! low byte after it.

/// Smallest frame that holds a sequence number
pub const MIN_FRAME: usize = 8;

/// Write frame `seq` into `buf`
pub fn fill(buf: &mut [u8], seq: u64) {
    buf[..MIN_FRAME].copy_from_slice(&seq.to_le_bytes());
    buf[MIN_FRAME..].fill(seq as u8);
}

/// Sequence number of `data`, if the frame is intact
pub fn check(data: &[u8]) -> Option<u64> {
    if data.len() < MIN_FRAME {
        return None;
    }
    let mut seq = [0u8; MIN_FRAME];
    seq.copy_from_slice(&data[..MIN_FRAME]);
    let seq = u64::from_le_bytes(seq);
    data[MIN_FRAME..]
        .iter()
        .all(|b| *b == seq as u8)
        .then_some(seq)
}
