//! Pixel counter code tables
//!
//! The sensor counts with a 12-bit linear feedback shift register instead
//! of a binary counter. A count of `n` leaves the register in the state
//! reached after `n` shifts from zero; decoding looks that state up.

use crate::constants::COUNTER_BITS;

const STATES: usize = 1 << COUNTER_BITS;
const MASK: u16 = (1 << COUNTER_BITS) - 1;

/// One shift of the counter register
///
/// Feedback is the XOR of bits 0, 3, 5 and 11, further XOR-ed with the NOR
/// of all bits so the register leaves the all-zero state.
#[inline]
pub fn next_state(state: u16) -> u16 {
    let bit = |i: u16| (state >> i) & 1;
    let all_zero = u16::from(state & MASK == 0);
    let feedback = all_zero ^ bit(0) ^ bit(3) ^ bit(5) ^ bit(11);
    ((state << 1) | feedback) & MASK
}

/// Code-to-count and count-to-code lookup tables
#[derive(Clone)]
pub struct CounterTables {
    decode: Box<[u16]>,
    encode: Box<[u16]>,
}

impl CounterTables {
    pub fn new() -> Self {
        let mut decode = vec![0u16; STATES].into_boxed_slice();
        let mut encode = vec![0u16; STATES].into_boxed_slice();

        let mut state = 0u16;
        for count in 0..STATES {
            encode[count] = state;
            decode[state as usize] = count as u16;
            state = next_state(state);
        }

        Self { decode, encode }
    }

    /// Count for a raw counter code; bits above 12 are ignored
    #[inline]
    pub fn decode(&self, code: u16) -> u16 {
        self.decode[(code & MASK) as usize]
    }

    /// Counter code for a count; bits above 12 are ignored
    #[inline]
    pub fn encode(&self, count: u16) -> u16 {
        self.encode[(count & MASK) as usize]
    }

    pub fn decode_table(&self) -> &[u16] {
        &self.decode
    }
}

impl Default for CounterTables {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CounterTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterTables").field("states", &STATES).finish()
    }
}
