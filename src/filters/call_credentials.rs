//! Attaches per-call metadata from a [`crate::credentials::CallCredentials`]
//! plugin before any other filter runs, so later filters (and the eventual
//! wire request) see the attached metadata as if the caller had set it
//! directly.

use super::{CallContext, Filter};
use crate::credentials::CallCredentials;
use crate::status::Status;
use async_trait::async_trait;
use std::sync::Arc;

pub struct CallCredentialsFilter {
    credentials: Arc<dyn CallCredentials>,
}

impl CallCredentialsFilter {
    pub fn new(credentials: Arc<dyn CallCredentials>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Filter for CallCredentialsFilter {
    async fn on_start_call(&self, ctx: &mut CallContext) -> Result<(), Status> {
        let metadata = self.credentials.get_request_metadata().await?;
        for (key, value) in metadata.as_headers().iter() {
            ctx.request.headers_mut().insert(key, value.clone());
        }
        Ok(())
    }
}
