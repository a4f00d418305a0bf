mod unified;

pub use unified::{ProviderType, UnifiedProvider};
