//! Rule Registry
//!
//! Ordered collection of rule templates. Given a concrete target, finds
//! the single rule able to produce it.

use std::path::Path;

use log::debug;

use super::model::RuleTemplate;
use super::validator::validate_rule;
use super::wildcards::Bindings;
use crate::error::{ConfigError, ResolveError};

/// The set of rules known to a pipeline.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<RuleTemplate>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a rule.
    pub fn add_rule(&mut self, rule: RuleTemplate) -> Result<(), ConfigError> {
        validate_rule(&rule)?;

        if self.rules.iter().any(|r| r.name == rule.name) {
            return Err(ConfigError::DuplicateRule(rule.name));
        }

        debug!("Registered rule '{}' -> {}", rule.name, rule.output);
        self.rules.push(rule);
        Ok(())
    }

    /// Builds a registry from a list of rules.
    pub fn from_rules(rules: impl IntoIterator<Item = RuleTemplate>) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for rule in rules {
            registry.add_rule(rule)?;
        }
        Ok(registry)
    }

    /// Finds the rule whose output pattern matches `target`.
    ///
    /// Returns `Ok(None)` if no rule matches and
    /// [`ResolveError::AmbiguousRule`] if more than one does.
    pub fn find_producer(
        &self,
        target: &Path,
    ) -> Result<Option<(&RuleTemplate, Bindings)>, ResolveError> {
        let mut matches: Vec<(&RuleTemplate, Bindings)> = self
            .rules
            .iter()
            .filter_map(|rule| rule.match_output(target).map(|b| (rule, b)))
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            _ => Err(ResolveError::AmbiguousRule {
                target: target.to_path_buf(),
                rules: matches.iter().map(|(r, _)| r.name.clone()).collect(),
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RuleTemplate> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleTemplate> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, input: &str, output: &str) -> RuleTemplate {
        RuleTemplate::parse(name, &[input], output, "cp -r {input} {output}").unwrap()
    }

    #[test]
    fn test_find_producer_binds_wildcards() {
        let registry = RuleRegistry::from_rules(vec![
            rule("tiles", "slides/{dataset}", "tiles/{dataset}"),
            rule("sorted", "tiles/{dataset}", "sorted/{dataset}"),
        ])
        .unwrap();

        let (found, bindings) = registry
            .find_producer(Path::new("sorted/ds1"))
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "sorted");
        assert_eq!(bindings["dataset"], "ds1");
    }

    #[test]
    fn test_find_producer_none() {
        let registry =
            RuleRegistry::from_rules(vec![rule("tiles", "slides/{dataset}", "tiles/{dataset}")])
                .unwrap();
        assert!(registry
            .find_producer(Path::new("slides/ds1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_find_producer_ambiguous() {
        let registry = RuleRegistry::from_rules(vec![
            rule("a", "in/{x}", "out/{x}"),
            rule("b", "other/{y}", "out/{y}"),
        ])
        .unwrap();

        let err = registry.find_producer(Path::new("out/1")).unwrap_err();
        match err {
            ResolveError::AmbiguousRule { rules, .. } => assert_eq!(rules, vec!["a", "b"]),
            other => panic!("Expected AmbiguousRule, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let mut registry = RuleRegistry::new();
        registry.add_rule(rule("a", "in/{x}", "out/{x}")).unwrap();
        let err = registry
            .add_rule(rule("a", "in/{x}", "other/{x}"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRule(ref n) if n == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let mut registry = RuleRegistry::new();
        let bad = rule("bad", "in/{x}", "out/{y}");
        assert!(registry.add_rule(bad).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_and_iter() {
        let registry = RuleRegistry::from_rules(vec![
            rule("first", "in/{x}", "mid/{x}"),
            rule("second", "mid/{x}", "out/{x}"),
        ])
        .unwrap();
        assert!(registry.get("second").is_some());
        assert!(registry.get("third").is_none());
        let names: Vec<_> = registry.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
