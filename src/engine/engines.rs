// Static engine registry

//! # Engine Registry
//!
//! Engines (Elasticsearch, Redshift, EMR, ...) run inside the dispatched batch
//! jobs and are not part of this crate. The scheduler only needs to know which
//! job definition family belongs to which engine name, so the registry is a
//! plain map filled once at startup. Unknown names are a configuration error.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::{Result, SchedulerError};

/// What the scheduler needs to know about an engine
pub trait EngineHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Job definition family, before the environment suffix is appended
    fn job_definition_name(&self) -> &str;
}

/// Engine that runs as a batch job definition
#[derive(Debug, Clone)]
pub struct BatchEngine {
    name: String,
    job_definition: String,
}

impl BatchEngine {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            job_definition: name.clone(),
            name,
        }
    }

    pub fn with_job_definition(mut self, job_definition: impl Into<String>) -> Self {
        self.job_definition = job_definition.into();
        self
    }
}

impl EngineHandler for BatchEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn job_definition_name(&self) -> &str {
        &self.job_definition
    }
}

#[derive(Clone, Default)]
pub struct EngineRegistry {
    handlers: HashMap<String, Arc<dyn EngineHandler>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the `engines` config section
    pub fn from_config(engines: &[EngineConfig]) -> Self {
        let mut registry = Self::new();
        for engine in engines {
            let handler = match &engine.job_definition {
                Some(job_definition) => {
                    BatchEngine::new(&engine.name).with_job_definition(job_definition)
                }
                None => BatchEngine::new(&engine.name),
            };
            registry.register(Arc::new(handler));
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn EngineHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn EngineHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownEngine(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_engine_is_rejected() {
        let registry = EngineRegistry::new();
        let err = registry.get("spark_engine").err().unwrap();
        assert!(matches!(err, SchedulerError::UnknownEngine(name) if name == "spark_engine"));
    }

    #[test]
    fn test_from_config_defaults_job_definition_to_name() {
        let registry = EngineRegistry::from_config(&[
            EngineConfig {
                name: "redshift_engine".into(),
                job_definition: None,
            },
            EngineConfig {
                name: "es".into(),
                job_definition: Some("elasticsearch_engine".into()),
            },
        ]);

        assert_eq!(
            registry.get("redshift_engine").unwrap().job_definition_name(),
            "redshift_engine"
        );
        assert_eq!(registry.get("es").unwrap().job_definition_name(), "elasticsearch_engine");
        assert_eq!(registry.names(), vec!["es".to_string(), "redshift_engine".to_string()]);
    }
}
