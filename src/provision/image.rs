use crate::engine::{Engine, EngineError, ImageMetadata};
use crate::error::Result;

/// Inspect `reference`, pulling it first if the engine does not have it.
pub async fn resolve_image(engine: &dyn Engine, reference: &str) -> Result<ImageMetadata> {
    match engine.inspect_image(reference).await {
        Ok(image) => {
            tracing::debug!("Image '{}' exists locally", reference);
            Ok(image)
        }
        Err(EngineError::NotFound { .. }) => {
            tracing::info!("Pulling image: {}", reference);
            engine.pull_image(reference).await?;
            tracing::info!("Pulled image: {}", reference);
            Ok(engine.inspect_image(reference).await?)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    #[tokio::test]
    async fn test_local_image_is_not_pulled() {
        let engine = FakeEngine::new().with_image(FakeEngine::python_hello());
        let image = resolve_image(&engine, "google/python-hello:latest")
            .await
            .unwrap();
        assert_eq!(image.volumes, vec!["/data".to_string()]);
        assert!(engine.calls_starting_with("pull_image").is_empty());
    }

    #[tokio::test]
    async fn test_missing_image_is_pulled() {
        let engine = FakeEngine::new().with_registry_image(FakeEngine::python_hello());
        let image = resolve_image(&engine, "google/python-hello:latest")
            .await
            .unwrap();
        assert_eq!(image.primary_tag(), "google/python-hello:latest");
        assert_eq!(
            engine.calls_starting_with("pull_image"),
            vec!["pull_image google/python-hello:latest".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_image_fails() {
        let engine = FakeEngine::new();
        let err = resolve_image(&engine, "nope:latest").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
