// Classic-BPF sampling filter generation.
//
// The kernel evaluates the program once per inbound netlink datagram before
// enqueueing it. The program loads the per-packet PRNG word (SKF_AD_RANDOM,
// kernel >= 3.15) and accepts the datagram when the word falls below
// rate * 2^32, so empirical acceptance converges to the requested rate.

use crate::error::CtError;

// BPF instruction classes and modes (identical to linux/filter.h).
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JGE: u16 = 0x30;
const BPF_RET: u16 = 0x06;
const BPF_K: u16 = 0x00;

// Ancillary load offsets (linux/filter.h).
const SKF_AD_OFF: i32 = -0x1000;
const SKF_AD_RANDOM: i32 = 56;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

fn insn(code: u16, jt: u8, jf: u8, k: u32) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

/// Compile a sampling filter that admits each datagram with probability
/// `rate`.
///
/// `rate` must be in `[0.0, 1.0)`; callers never request a filter for a
/// full sampling rate.
pub fn generate(rate: f64) -> Result<Vec<SockFilter>, CtError> {
    if !(0.0..1.0).contains(&rate) {
        return Err(CtError::SamplingRate(rate));
    }

    let threshold = (rate * f64::from(u32::MAX)) as u32;

    Ok(vec![
        // Load the per-packet random word.
        insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, (SKF_AD_OFF + SKF_AD_RANDOM) as u32),
        // random >= threshold: drop, else accept.
        insn(BPF_JMP | BPF_JGE | BPF_K, 0, 1, threshold),
        insn(BPF_RET | BPF_K, 0, 0, 0),
        insn(BPF_RET | BPF_K, 0, 0, u32::MAX),
    ])
}
