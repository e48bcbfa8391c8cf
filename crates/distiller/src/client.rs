//! Routable model clients

use distillr_common::config::{ClientDescriptor, InferBackend};
use distillr_common::{DistillrConfig, Result};
use distillr_engine::{build_engine, ChatEngine};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A configured backend and the engine that serves it
#[derive(Clone)]
pub struct Client {
    pub descriptor: ClientDescriptor,
    pub engine: Arc<dyn ChatEngine>,
}

impl Client {
    pub fn new(descriptor: ClientDescriptor, engine: Arc<dyn ChatEngine>) -> Self {
        Self { descriptor, engine }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Model name requests are routed by
    pub fn model(&self) -> &str {
        &self.descriptor.model
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.descriptor.id)
            .field("endpoint", &self.descriptor.endpoint)
            .field("model", &self.descriptor.model)
            .field("backend", &self.descriptor.backend)
            .finish()
    }
}

/// Build a client per descriptor
///
/// Local descriptors that point at the same model file share one engine, so
/// the weights are loaded once. Must run inside a tokio runtime.
pub fn parse_clients(
    descriptors: &[ClientDescriptor],
    config: &DistillrConfig,
) -> Result<Vec<Client>> {
    parse_clients_with(descriptors, |descriptor| build_engine(descriptor, config))
}

pub(crate) fn parse_clients_with<F>(descriptors: &[ClientDescriptor], mut build: F) -> Result<Vec<Client>>
where
    F: FnMut(&ClientDescriptor) -> Result<Arc<dyn ChatEngine>>,
{
    let mut local_engines: HashMap<&str, Arc<dyn ChatEngine>> = HashMap::new();
    let mut clients = Vec::with_capacity(descriptors.len());

    for descriptor in descriptors {
        let engine = match descriptor.backend {
            InferBackend::Local => match local_engines.get(descriptor.endpoint.as_str()) {
                Some(engine) => Arc::clone(engine),
                None => {
                    let engine = build(descriptor)?;
                    local_engines.insert(descriptor.endpoint.as_str(), Arc::clone(&engine));
                    engine
                }
            },
            InferBackend::Remote => build(descriptor)?,
        };

        info!(
            client = %descriptor.id,
            model = %descriptor.model,
            backend = %descriptor.backend,
            endpoint = %descriptor.endpoint,
            "Client ready"
        );
        clients.push(Client::new(descriptor.clone(), engine));
    }

    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;
    use distillr_common::DistillError;

    fn descriptor(id: &str, endpoint: &str, backend: InferBackend) -> ClientDescriptor {
        ClientDescriptor {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            model: "m".to_string(),
            backend,
            api_key_env: None,
            weight: 1,
        }
    }

    #[test]
    fn test_local_engines_are_shared() {
        let descriptors = vec![
            descriptor("a", "/models/q.gguf", InferBackend::Local),
            descriptor("b", "/models/q.gguf", InferBackend::Local),
            descriptor("c", "/models/other.gguf", InferBackend::Local),
            descriptor("d", "http://x/v1", InferBackend::Remote),
            descriptor("e", "http://x/v1", InferBackend::Remote),
        ];

        let mut builds = 0;
        let clients = parse_clients_with(&descriptors, |_| {
            builds += 1;
            Ok(Arc::new(ScriptedEngine::new("m")) as Arc<dyn ChatEngine>)
        })
        .unwrap();

        assert_eq!(clients.len(), 5);
        assert_eq!(builds, 4);
        assert!(Arc::ptr_eq(&clients[0].engine, &clients[1].engine));
        assert!(!Arc::ptr_eq(&clients[0].engine, &clients[2].engine));
        assert_eq!(clients[3].id(), "d");
    }

    #[test]
    fn test_build_error_propagates() {
        let descriptors = vec![descriptor("a", "/missing.gguf", InferBackend::Local)];
        let err = parse_clients_with(&descriptors, |_| Err(DistillError::model("no weights")))
            .unwrap_err();
        assert!(matches!(err, DistillError::Model(_)));
    }

    #[tokio::test]
    async fn test_parse_remote_clients() {
        let config = DistillrConfig::from_yaml_str(
            r#"
model:
  model_name_or_path: r1
data:
  dataset_path: qa.json
clients:
  - { id: a, endpoint: "http://localhost:8000/v1", model: r1 }
  - { id: b, endpoint: "http://localhost:8001/v1", model: r1, weight: 2 }
"#,
        )
        .unwrap();

        let clients = parse_clients(&config.effective_clients(), &config).unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[1].descriptor.weight, 2);
        assert_eq!(clients[0].engine.model_name(), "r1");
    }
}
