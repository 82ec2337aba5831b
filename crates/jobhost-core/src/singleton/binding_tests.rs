//! Tests for binding expressions.

use super::*;

fn data(pairs: &[(&str, &str)]) -> BindingData {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

mod settings {
    use super::*;

    /// Verify that setting references are replaced.
    #[test]
    fn test_resolves_settings() {
        let resolver = MapNameResolver::new(HashMap::from([(
            "Region".to_string(),
            "westus".to_string(),
        )]));

        assert_eq!(
            resolve_settings("lock-%Region%-{id}", &resolver).unwrap(),
            "lock-westus-{id}"
        );
        assert_eq!(resolve_settings("plain", &resolver).unwrap(), "plain");
    }

    /// Verify that unknown settings are an error.
    #[test]
    fn test_unresolved_setting() {
        let resolver = MapNameResolver::default();
        let error = resolve_settings("%Missing%", &resolver).unwrap_err();

        assert_eq!(
            error,
            BindingError::UnresolvedSetting {
                name: "Missing".to_string()
            }
        );
    }
}

mod templates {
    use super::*;

    /// Verify that parameters are substituted from binding data.
    #[test]
    fn test_bind_parameters() {
        let template = BindingTemplate::parse("{Region}/{Id}-x").unwrap();

        assert!(template.has_parameters());
        assert_eq!(template.parameter_names(), vec!["Region", "Id"]);
        assert_eq!(
            template
                .bind(&data(&[("Region", "eu"), ("Id", "42")]))
                .unwrap(),
            "eu/42-x"
        );
    }

    /// Verify that lookup falls back to a case-insensitive match.
    #[test]
    fn test_bind_is_case_insensitive() {
        let template = BindingTemplate::parse("{region}").unwrap();
        assert_eq!(template.bind(&data(&[("Region", "eu")])).unwrap(), "eu");
    }

    /// Verify that a missing parameter is a binding error.
    #[test]
    fn test_missing_parameter() {
        let template = BindingTemplate::parse("{Region}").unwrap();
        let error = template.bind(&BindingData::new()).unwrap_err();

        assert_eq!(error.to_string(), "No value for named parameter 'Region'.");
    }

    /// Verify that literal templates bind to themselves.
    #[test]
    fn test_literal_template() {
        let template = BindingTemplate::parse("TestValue").unwrap();

        assert!(!template.has_parameters());
        assert_eq!(template.bind(&BindingData::new()).unwrap(), "TestValue");
    }

    /// Verify that malformed templates are rejected.
    #[test]
    fn test_malformed_templates() {
        assert!(BindingTemplate::parse("{}").is_err());
        assert!(BindingTemplate::parse("{1abc}").is_err());
        assert!(BindingTemplate::parse("{open").is_err());
        assert!(BindingTemplate::parse("close}").is_err());
    }
}
