use domain::common::entity::EngineKind;
use ports::secondary::engine_port::{EngineError, EnginePort};

use crate::nft::NftEngine;
use crate::test_engine::TestEngine;

/// Construct the engine for a kind. The engine set is closed; an unknown
/// kind is a configuration-time error that validation normally catches
/// earlier.
pub fn new_engine(kind: EngineKind) -> Result<Box<dyn EnginePort>, EngineError> {
    match kind {
        EngineKind::TestEngine => Ok(Box::new(TestEngine::new())),
        EngineKind::Nftables => Ok(Box::new(NftEngine::new())),
        EngineKind::Unknown => Err(EngineError::Start(
            "requested unknown engine kind".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_construct() {
        assert_eq!(
            new_engine(EngineKind::TestEngine).unwrap().kind(),
            EngineKind::TestEngine
        );
        assert_eq!(
            new_engine(EngineKind::Nftables).unwrap().kind(),
            EngineKind::Nftables
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(new_engine(EngineKind::Unknown).is_err());
    }
}
