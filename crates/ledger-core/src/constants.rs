pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;
/// Leading zero hex characters a proof digest must start with.
pub const DIFFICULTY: usize = 4;
pub const GENESIS_PROOF: u64 = 100;
pub const GENESIS_SENTINEL: &str = "1";
pub const MINING_SENDER: &str = "0";
pub const MINING_REWARD: f64 = 1.0;
