use async_trait::async_trait;
use std::sync::Arc;

use super::{AnnotationBackend, AnnotationError, AnnotationRequest, AnnotationResult};

/// Tries `primary`, then `secondary` once if the primary fails.
pub struct FallbackBackend {
    primary: Arc<dyn AnnotationBackend>,
    secondary: Option<Arc<dyn AnnotationBackend>>,
}

impl FallbackBackend {
    pub fn new(
        primary: Arc<dyn AnnotationBackend>,
        secondary: Option<Arc<dyn AnnotationBackend>>,
    ) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl AnnotationBackend for FallbackBackend {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn annotate(
        &self,
        request: &AnnotationRequest,
    ) -> Result<AnnotationResult, AnnotationError> {
        let primary_err = match self.primary.annotate(request).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let Some(secondary) = &self.secondary else {
            return Err(AnnotationError::FallbackExhausted {
                primary: Box::new(primary_err),
                secondary: None,
            });
        };

        tracing::warn!(
            task = %request.task,
            primary = self.primary.name(),
            secondary = secondary.name(),
            error = %primary_err,
            "gateway.fallback"
        );

        match secondary.annotate(request).await {
            Ok(result) => Ok(result),
            Err(secondary_err) => Err(AnnotationError::FallbackExhausted {
                primary: Box::new(primary_err),
                secondary: Some(Box::new(secondary_err)),
            }),
        }
    }
}
