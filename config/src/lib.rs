//! Configuration types shared between gym crates.

mod train;
mod types;

pub use train::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_serde() {
        assert_eq!(
            serde_json::from_str::<RunMode>("\"re_eval\"").unwrap(),
            RunMode::ReEval
        );
        assert_eq!(
            serde_json::from_str::<ValidationMode>("\"nested_cv\"").unwrap(),
            ValidationMode::NestedCv
        );
        assert_eq!(
            serde_json::from_str::<Device>("\"cuda:1\"").unwrap(),
            Device::Cuda(1)
        );
        assert_eq!(serde_json::to_string(&Device::Cpu).unwrap(), "\"cpu\"");
    }

    #[test]
    fn test_run_mode_from_str() {
        assert_eq!("train".parse::<RunMode>().unwrap(), RunMode::Train);
        assert_eq!("re-eval".parse::<RunMode>().unwrap(), RunMode::ReEval);
        assert_eq!("RE_EVAL".parse::<RunMode>().unwrap(), RunMode::ReEval);
        assert!("evaluate".parse::<RunMode>().is_err());
    }

    #[test]
    fn test_validation_mode_from_str() {
        assert_eq!(
            "grid_search".parse::<ValidationMode>().unwrap(),
            ValidationMode::GridSearch
        );
        assert_eq!(
            "cross-validation".parse::<ValidationMode>().unwrap(),
            ValidationMode::CrossValidation
        );
        assert_eq!(
            "nested_cv".parse::<ValidationMode>().unwrap(),
            ValidationMode::NestedCv
        );
        assert!("bogus".parse::<ValidationMode>().is_err());
        assert!(!ValidationMode::GridSearch.needs_evaluation_config());
        assert!(ValidationMode::NestedCv.needs_evaluation_config());
    }

    #[test]
    fn test_device_from_str() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert_eq!("2".parse::<Device>().unwrap(), Device::Cuda(2));
        assert!("tpu".parse::<Device>().is_err());
        assert!(!Device::Cpu.is_exclusive());
        assert!(Device::Cuda(0).is_exclusive());
        assert_eq!(Device::Cuda(7).to_string(), "cuda:7");
    }

    #[test]
    fn test_experiment_id_segments() {
        let id = ExperimentId::new("gs/run-a").join("fold_1");
        assert_eq!(id.as_str(), "gs/run-a/fold_1");
        assert_eq!(id.segments().unwrap(), vec!["gs", "run-a", "fold_1"]);

        assert!(ExperimentId::new("gs/../etc").segments().is_err());
        assert!(ExperimentId::new("gs//x").segments().is_err());
        assert!(ExperimentId::new("").segments().is_err());
    }

    #[test]
    fn test_epoch_list() {
        let list: EpochList = "1,3,5".parse().unwrap();
        assert_eq!(list.0, vec![1, 3, 5]);
        assert_eq!(list.to_string(), "1,3,5");

        let list: EpochList = "1..=3, 10".parse().unwrap();
        assert_eq!(list.0, vec![1, 2, 3, 10]);

        assert!("".parse::<EpochList>().is_err());
        assert!("3..=1".parse::<EpochList>().is_err());
        assert!("a".parse::<EpochList>().is_err());
    }

    #[test]
    fn test_epoch_list_length_capped() {
        let err = "0..=18446744073709551615".parse::<EpochList>().unwrap_err();
        assert!(err.contains("exceeds"), "{err}");

        let full = format!("1..={MAX_EPOCH_LIST_LEN}");
        assert_eq!(full.parse::<EpochList>().unwrap().0.len(), MAX_EPOCH_LIST_LEN);
        assert!(format!("{full},7").parse::<EpochList>().is_err());
        assert!(format!("0,{full}").parse::<EpochList>().is_err());
    }

    #[test]
    fn test_early_stopping_config_toml() {
        let config: EarlyStoppingConfig = toml::from_str(
            r#"
strategy = "last_k_epochs_improvement"
min_relative_improvement = 0.01
epochs_window = 3
split_name = "val"
monitoring_key = "loss"
"#,
        )
        .unwrap();
        assert!(matches!(
            config,
            EarlyStoppingConfig::LastKEpochsImprovement {
                epochs_window: 3,
                is_increase_task: false,
                ..
            }
        ));
        assert_eq!(config.split_name(), "val");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_early_stopping_config_validate() {
        let config = EarlyStoppingConfig::Patience {
            patience: 0,
            min_delta: 0.0,
            split_name: "val".to_string(),
            monitoring_key: "loss".to_string(),
            is_increase_task: false,
        };
        assert!(config.validate().is_err());

        let config = EarlyStoppingConfig::LastKEpochsImprovement {
            min_relative_improvement: 0.1,
            epochs_window: 1,
            split_name: "val".to_string(),
            monitoring_key: "loss".to_string(),
            is_increase_task: true,
        };
        assert!(config.validate().is_err());
    }
}
