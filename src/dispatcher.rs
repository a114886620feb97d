//! Message dispatch: from what the user typed to a turn and an upstream send

pub mod context;

use crate::flow::{ImageAttachment, SessionConfig, TurnStatus, UserMessage};
use crate::runtime::{CollaboratorError, CoreContext, ImageUpload};
use crate::state_machine::{ApplyError, SessionEvent};
use chrono::Utc;
use context::{build_model_body, decode_inline_image, ContextItem};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A prepared message, ready to send or to replay from the retry queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub id: String,
    pub session_id: String,
    /// Id of the local turn, reused by every replay
    pub local_turn_id: String,
    /// What the user typed; stored on the turn
    pub display_body: String,
    /// Context expansions plus the text; only this goes upstream
    pub model_body: String,
    pub agent_type: String,
    pub images: Vec<ImageAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub session_id: String,
    pub turn_id: String,
    pub message_id: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No model is configured for the workspace")]
    NoWorkspaceModel,
    #[error("Session creation failed: {0}")]
    SessionCreationFailed(CollaboratorError),
    #[error("Image upload failed: {0}")]
    ImageUploadFailed(String),
    /// The caller may hand `message` to the retry queue
    #[error("Upstream rejected the message: {reason}")]
    UpstreamRejected {
        message: Box<OutgoingMessage>,
        reason: CollaboratorError,
    },
    #[error(transparent)]
    Session(#[from] ApplyError),
}

pub struct MessageDispatcher {
    ctx: CoreContext,
}

impl MessageDispatcher {
    pub fn new(ctx: CoreContext) -> Self {
        Self { ctx }
    }

    /// Send `text` with `contexts` in the active session, creating one if
    /// needed. `contexts` is cleared only once the backend accepted.
    pub async fn send_message(
        &self,
        text: &str,
        contexts: &mut Vec<ContextItem>,
        agent_type: &str,
    ) -> Result<SendReceipt, DispatchError> {
        let session_id = self.ensure_session(agent_type).await?;

        let mut prepared = contexts.clone();
        self.upload_images(&session_id, &mut prepared).await?;

        let message = OutgoingMessage {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            local_turn_id: uuid::Uuid::new_v4().to_string(),
            display_body: text.to_string(),
            model_body: build_model_body(text, &prepared),
            agent_type: agent_type.to_string(),
            images: attachments(&prepared),
        };
        self.deliver(&message).await?;

        contexts.clear();
        Ok(SendReceipt {
            session_id: message.session_id,
            turn_id: message.local_turn_id,
            message_id: message.id,
        })
    }

    /// First send: create the local turn, then send upstream.
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), DispatchError> {
        let user_message = UserMessage {
            id: message.id.clone(),
            content: message.display_body.clone(),
            images: message.images.clone(),
            timestamp: Utc::now(),
        };
        self.ctx
            .apply(SessionEvent::TurnStarted {
                session_id: message.session_id.clone(),
                turn_id: message.local_turn_id.clone(),
                user_message,
            })
            .await?;
        self.send_upstream(message).await
    }

    /// Send a queued message again.
    ///
    /// The local turn must still exist and be open; a turn being cancelled
    /// counts as closed. A replay never creates the turn: one dropped by a
    /// rollback stays dropped.
    pub async fn redeliver(&self, message: &OutgoingMessage) -> Result<(), DispatchError> {
        let status = self
            .ctx
            .manager
            .read()
            .await
            .turn_status(&message.session_id, &message.local_turn_id);
        match status {
            None => {
                return Err(ApplyError::UnknownTurn {
                    session_id: message.session_id.clone(),
                    turn_id: message.local_turn_id.clone(),
                }
                .into())
            }
            Some(status) if status.is_terminal() || status == TurnStatus::Cancelling => {
                return Err(ApplyError::TurnClosed {
                    turn_id: message.local_turn_id.clone(),
                    status,
                }
                .into())
            }
            Some(_) => {}
        }
        self.send_upstream(message).await
    }

    async fn send_upstream(&self, message: &OutgoingMessage) -> Result<(), DispatchError> {
        if let Err(reason) = self.ctx.collaborators.upstream.send(message).await {
            tracing::warn!(
                session_id = %message.session_id,
                turn_id = %message.local_turn_id,
                error = %reason,
                "Upstream rejected message"
            );
            return Err(DispatchError::UpstreamRejected {
                message: Box::new(message.clone()),
                reason,
            });
        }
        tracing::info!(
            session_id = %message.session_id,
            turn_id = %message.local_turn_id,
            "Message sent"
        );
        Ok(())
    }

    async fn ensure_session(&self, agent_type: &str) -> Result<String, DispatchError> {
        if let Some(session_id) = self.ctx.manager.read().await.active_session_id() {
            return Ok(session_id.to_string());
        }

        let bootstrap = &self.ctx.collaborators.bootstrap;
        let model_id = bootstrap
            .resolve_default_model()
            .await
            .ok_or(DispatchError::NoWorkspaceModel)?;
        let config = SessionConfig {
            model_id,
            agent_type: agent_type.to_string(),
            max_context_tokens: self.ctx.config.max_context_tokens,
        };
        let session_id = bootstrap
            .create_session(&config)
            .await
            .map_err(DispatchError::SessionCreationFailed)?;

        let effects = {
            let mut manager = self.ctx.manager.write().await;
            let mut effects = manager.create_session(session_id.clone(), config)?;
            effects.extend(manager.switch_session(&session_id)?);
            effects
        };
        self.ctx.execute(effects).await;
        Ok(session_id)
    }

    /// Upload every inline image, all or nothing, and record the image ids.
    async fn upload_images(&self, session_id: &str, contexts: &mut [ContextItem]) -> Result<(), DispatchError> {
        let mut uploads = Vec::new();
        for item in contexts.iter().filter(|item| item.needs_upload()) {
            if let ContextItem::Image {
                id,
                name,
                data: Some(data),
                mime_type,
                ..
            } = item
            {
                let (prefix_mime, bytes) = decode_inline_image(data)
                    .map_err(|e| DispatchError::ImageUploadFailed(format!("{name}: {e}")))?;
                uploads.push(ImageUpload {
                    context_id: id.clone(),
                    name: name.clone(),
                    mime_type: mime_type.clone().or(prefix_mime),
                    bytes,
                });
            }
        }
        if uploads.is_empty() {
            return Ok(());
        }

        let uploaded = self
            .ctx
            .collaborators
            .uploader
            .upload_image_contexts(session_id, &uploads)
            .await
            .map_err(|e| DispatchError::ImageUploadFailed(e.to_string()))?;
        let image_ids: HashMap<&str, &str> = uploaded
            .iter()
            .map(|image| (image.context_id.as_str(), image.image_id.as_str()))
            .collect();
        if let Some(missing) = uploads
            .iter()
            .find(|upload| !image_ids.contains_key(upload.context_id.as_str()))
        {
            return Err(DispatchError::ImageUploadFailed(format!(
                "no image id returned for {}",
                missing.name
            )));
        }

        for item in contexts.iter_mut() {
            if let ContextItem::Image { id, data, image_id, .. } = item {
                if let Some(uploaded_id) = image_ids.get(id.as_str()) {
                    *image_id = Some((*uploaded_id).to_string());
                    *data = None;
                }
            }
        }
        tracing::debug!(session_id = %session_id, count = uploads.len(), "Images uploaded");
        Ok(())
    }
}

fn attachments(contexts: &[ContextItem]) -> Vec<ImageAttachment> {
    contexts
        .iter()
        .filter_map(|item| match item {
            ContextItem::Image { id, name, image_id, .. } => Some(ImageAttachment {
                id: image_id.clone().unwrap_or_else(|| id.clone()),
                name: name.clone(),
            }),
            _ => None,
        })
        .collect()
}
