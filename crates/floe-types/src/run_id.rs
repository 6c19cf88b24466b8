use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Short random identifier stamped on every object a run uploads, so that
/// a recycled bag number never lands on an existing remote key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub [u8; 4]);

impl RunId {
    pub fn generate() -> Self {
        let mut buf = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut buf);
        RunId(buf)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunId({})", self.to_hex())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_eight_chars() {
        assert_eq!(RunId([0xde, 0xad, 0xbe, 0xef]).to_hex(), "deadbeef");
        assert_eq!(RunId::generate().to_hex().len(), 8);
    }
}
