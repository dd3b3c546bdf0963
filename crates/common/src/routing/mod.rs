//! Token routing: turning a request path into a redirect or a delivery
//!
//! ```text
//! /TOKEN                -> redirect to the unlock or deposit page
//! /CODE/TOKEN           -> the single file, or Bundle_TOKEN.zip
//! /CODE/TOKEN.zip       -> Bundle_TOKEN.zip
//! /CODE/TOKEN/filename  -> that file
//! ```

mod archive;
mod path;

use bytes::Bytes;
use chrono::Utc;

use crate::allocation::{AllocationManager, UnlockedFile};
use crate::anonymous::AnonymousService;
use crate::session::Session;
use crate::store::Transaction;
use crate::token::{TokenCategory, TokenService};
use crate::{Backend, Error, Result};

pub use archive::StoredArchive;
pub use path::{Target, TokenPath};

/// Where a bare token sends the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Unlock(String),
    Deposit(String),
}

#[derive(Debug, Clone)]
pub enum Delivery {
    File {
        name: String,
        mime_type: String,
        length: u64,
        data: Bytes,
    },
    Archive {
        name: String,
        data: Bytes,
    },
}

impl Delivery {
    pub fn name(&self) -> &str {
        match self {
            Delivery::File { name, .. } | Delivery::Archive { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Resolution {
    /// Not a token path; the caller should pass it on
    Unmatched,
    NotFound,
    Redirect(Redirect),
    /// A token of a category that has no public route
    Unroutable(TokenCategory),
    Deliver(Delivery),
}

#[derive(Debug, Clone)]
pub struct TokenResolver {
    backend: Backend,
    tokens: TokenService,
    anonymous: AnonymousService,
    allocations: AllocationManager,
}

impl TokenResolver {
    pub fn new(backend: Backend) -> Self {
        Self {
            tokens: TokenService::new(),
            anonymous: AnonymousService::new(backend.clone()),
            allocations: AllocationManager::new(backend.clone()),
            backend,
        }
    }

    /// Resolve a request path in a transaction of its own.
    pub async fn resolve(&self, session: &Session, path: &str) -> Result<Resolution> {
        let Some(token_path) = TokenPath::parse(path) else {
            return Ok(Resolution::Unmatched);
        };

        let mut tx = self.backend.entities.begin().await?;
        let resolution = match &token_path.code {
            None => self.route(tx.as_mut(), &token_path.token).await?,
            Some(code) => {
                self.deliver(session, tx.as_mut(), &token_path, code)
                    .await?
            }
        };
        tx.commit().await?;
        Ok(resolution)
    }

    async fn route(&self, tx: &mut dyn Transaction, path: &str) -> Result<Resolution> {
        let Some(token) = self.tokens.retrieve_by_path(tx, path).await? else {
            tracing::debug!("no token at /{}", path);
            return Ok(Resolution::NotFound);
        };
        Ok(match token.category {
            TokenCategory::Anonymous => Resolution::Redirect(Redirect::Unlock(token.path)),
            TokenCategory::Inbox => Resolution::Redirect(Redirect::Deposit(token.path)),
            category => {
                tracing::error!("token /{} of category {} has no route", token.path, category);
                Resolution::Unroutable(category)
            }
        })
    }

    async fn deliver(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        path: &TokenPath,
        code: &str,
    ) -> Result<Resolution> {
        let unlocked = self
            .anonymous
            .unlock(session, tx, &path.token, code)
            .await?;
        let files = self
            .allocations
            .retrieve_files(session, tx, unlocked.allocation.id)
            .await?;

        let now = Utc::now();
        let (live, expired): (Vec<UnlockedFile>, Vec<UnlockedFile>) =
            files.into_iter().partition(|f| !f.file.is_expired_at(now));
        if live.is_empty() {
            return Err(if expired.is_empty() {
                Error::NotFound
            } else {
                Error::Expired
            });
        }

        match &path.target {
            Target::File(name) => {
                let Some(file) = live.iter().find(|f| &f.descriptor.name == name) else {
                    return Ok(Resolution::NotFound);
                };
                self.deliver_file(session, tx, file).await
            }
            Target::Default if live.len() == 1 => self.deliver_file(session, tx, &live[0]).await,
            Target::Default | Target::Archive => {
                self.deliver_archive(session, tx, &path.token, &live).await
            }
        }
    }

    async fn deliver_file(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        file: &UnlockedFile,
    ) -> Result<Resolution> {
        let downloaded = self.allocations.download(session, tx, file.file.id).await?;
        Ok(Resolution::Deliver(Delivery::File {
            name: downloaded.descriptor.name,
            mime_type: downloaded.descriptor.mime_type,
            length: downloaded.descriptor.length,
            data: downloaded.data,
        }))
    }

    async fn deliver_archive(
        &self,
        session: &Session,
        tx: &mut dyn Transaction,
        token: &str,
        files: &[UnlockedFile],
    ) -> Result<Resolution> {
        let mut archive = StoredArchive::new();
        for file in files {
            let downloaded = self.allocations.download(session, tx, file.file.id).await?;
            archive.add_entry(
                &downloaded.descriptor.name,
                downloaded.descriptor.length,
                &downloaded.data,
                Utc::now(),
            )?;
        }
        let data = archive.finish()?;

        Ok(Resolution::Deliver(Delivery::Archive {
            name: format!("Bundle_{}.zip", token),
            data: data.into(),
        }))
    }
}
