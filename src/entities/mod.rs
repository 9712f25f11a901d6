// Entity Models
// "Identity persists, values change"
//
// Each entity has:
// - Stable identity (UUID) that NEVER changes
// - Timeline of immutable values (wallets keep every balance version)
// - Registry for lookups

pub mod investment;
pub mod wallet;

pub use investment::{Investment, PaymentStatus};
pub use wallet::{address_key, Network, Wallet, WalletRegistry, WalletSnapshot};
