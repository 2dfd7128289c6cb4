//! Integration tests for config

#[cfg(test)]
mod tests {
    use buildops_config::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to ensure env var tests don't run concurrently
    static ENV_TEST_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 5] = [
        "BUILDOPS_EVICT_ON_FINISH",
        "BUILDOPS_VALIDATE_CONTEXT",
        "BUILDOPS_ISOLATE_PANICS",
        "BUILDOPS_EXPECTED_CODES",
        "BUILDOPS_MAX_WORKERS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[tokio::test]
    async fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[tracking]
evict_on_finish = true
validate_resumed_context = false

[classifier]
expected_codes = ["build.task_failed"]

[queue]
max_workers = 6
        "#
        )
        .unwrap();

        let config = Config::load_from_file(temp_file.path()).await.unwrap();
        assert!(config.tracking.evict_on_finish);
        assert!(!config.tracking.validate_resumed_context);
        assert_eq!(config.classifier.expected_codes, vec!["build.task_failed"]);
        assert_eq!(config.queue.max_workers, 6);
        // untouched section keeps its defaults
        assert!(config.dispatch.isolate_listener_panics);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load_from_file(&dir.path().join("absent.toml")).await;
        assert!(matches!(
            result,
            Err(buildops_errors::Error::Config(
                buildops_errors::ConfigError::NotFound { .. }
            ))
        ));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let result = Config::from_toml_str("[tracking\nevict_on_finish = ");
        assert!(matches!(
            result,
            Err(buildops_errors::Error::Config(
                buildops_errors::ConfigError::ParseError { .. }
            ))
        ));
    }

    #[test]
    fn test_merge_env() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        clear_env();

        std::env::set_var("BUILDOPS_EVICT_ON_FINISH", "yes");
        std::env::set_var("BUILDOPS_VALIDATE_CONTEXT", "0");
        std::env::set_var("BUILDOPS_EXPECTED_CODES", "build.task_failed, build.timeout,");
        std::env::set_var("BUILDOPS_MAX_WORKERS", "2");

        let mut config = Config::default();
        config.merge_env().unwrap();

        assert!(config.tracking.evict_on_finish);
        assert!(!config.tracking.validate_resumed_context);
        assert_eq!(
            config.classifier.expected_codes,
            vec!["build.task_failed", "build.timeout"]
        );
        assert_eq!(config.queue.max_workers, 2);

        clear_env();
    }

    #[test]
    fn test_invalid_env_value() {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        clear_env();

        std::env::set_var("BUILDOPS_ISOLATE_PANICS", "sometimes");

        let mut config = Config::default();
        let result = config.merge_env();
        assert!(result.is_err());

        clear_env();
    }
}
