pub mod config;
pub mod descriptor;
pub mod error;
pub mod uid;

pub use config::{Config, ConfigSnapshot};
pub use descriptor::DescriptorRecord;
pub use error::{Error, Result};
pub use uid::Uid;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trip_is_idempotent() {
        let snap = ConfigSnapshot {
            factory_string: "IVF256,Flat".to_string(),
            ivf_nprobe: 8,
            read_only: true,
            use_gpu: false,
            gpu_id: None,
            random_seed: Some(42),
        };
        let cfg = Config::from_snapshot(snap.clone()).unwrap();
        let round_tripped = Config::from_snapshot(cfg.to_snapshot()).unwrap();
        assert_eq!(cfg.to_snapshot(), round_tripped.to_snapshot());
        assert_eq!(cfg.to_snapshot(), snap);
    }

    #[test]
    fn nprobe_below_one_is_invalid() {
        let mut snap = ConfigSnapshot::default();
        snap.ivf_nprobe = 0;
        let err = Config::from_snapshot(snap).unwrap_err();
        match err {
            Error::InvalidConfig(msg) => assert!(msg.contains("ivf_nprobe")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn uid_not_found_names_the_offender() {
        let err = Error::uid_not_found(Uid::from(10u64));
        assert!(matches!(err, Error::UidNotFound(Uid::Int(10))));
    }
}
