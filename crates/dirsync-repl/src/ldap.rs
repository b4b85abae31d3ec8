//! [`DirectoryClient`] over an LDAP connection.
//!
//! The bound connection is cached and shared; a transport failure drops it
//! so the next operation reconnects. Reconnect pacing is the caller's job.

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult, Mod, SearchEntry};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::{DirectoryClient, DirectoryResult, Scope};
use crate::entry::{Entry, ModOp, Modification};
use crate::error::DirectoryError;

/// Connection parameters for one directory.
#[derive(Debug, Clone)]
pub struct LdapSettings {
    /// `ldap://` or `ldaps://` URL (any path component is ignored).
    pub url: String,
    /// DN to bind as; empty for anonymous.
    pub bind_dn: String,
    /// Bind password.
    pub bind_password: String,
    /// Connect timeout.
    pub connect_timeout: Duration,
}

impl LdapSettings {
    /// Settings with a 10 second connect timeout.
    pub fn new(url: &str, bind_dn: &str, bind_password: &str) -> Self {
        Self {
            url: url.to_string(),
            bind_dn: bind_dn.to_string(),
            bind_password: bind_password.to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// `scheme://host:port` without any path or query.
    pub fn server_url(&self) -> String {
        match self.url.split_once("://") {
            Some((scheme, rest)) => {
                let host = rest.split(['/', '?']).next().unwrap_or(rest);
                format!("{}://{}", scheme, host)
            }
            None => self.url.clone(),
        }
    }
}

/// A directory reached over LDAP.
pub struct LdapDirectory {
    settings: LdapSettings,
    connection: Mutex<Option<Ldap>>,
}

impl std::fmt::Debug for LdapDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapDirectory")
            .field("url", &self.settings.url)
            .field("bind_dn", &self.settings.bind_dn)
            .finish()
    }
}

impl LdapDirectory {
    /// Create a client; no connection is made until first use.
    pub fn new(settings: LdapSettings) -> Self {
        Self {
            settings,
            connection: Mutex::new(None),
        }
    }

    /// Connect and bind now instead of on first use.
    pub async fn connect(&self) -> DirectoryResult<()> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> DirectoryResult<Ldap> {
        let mut guard = self.connection.lock().await;
        if let Some(ref ldap) = *guard {
            return Ok(ldap.clone());
        }
        let ldap = self.create_connection().await?;
        *guard = Some(ldap.clone());
        Ok(ldap)
    }

    async fn create_connection(&self) -> DirectoryResult<Ldap> {
        let url = self.settings.server_url();
        debug!(url = %url, "Connecting to directory");

        let settings = LdapConnSettings::new().set_conn_timeout(self.settings.connect_timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| DirectoryError::Connection {
                msg: format!("failed to connect to {}: {}", url, e),
            })?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "Directory connection driver error");
            }
        });

        if !self.settings.bind_dn.is_empty() {
            let result = ldap
                .simple_bind(&self.settings.bind_dn, &self.settings.bind_password)
                .await
                .map_err(|e| DirectoryError::Connection {
                    msg: format!("bind to {} failed: {}", url, e),
                })?;
            if result.rc != 0 {
                return Err(DirectoryError::Connection {
                    msg: format!(
                        "bind to {} as {} rejected with code {}: {}",
                        url, self.settings.bind_dn, result.rc, result.text
                    ),
                });
            }
        }

        info!(url = %url, "Directory connection established");
        Ok(ldap)
    }

    /// Forget a broken connection so the next call reconnects.
    async fn invalidate(&self, err: LdapError) -> DirectoryError {
        warn!(url = %self.settings.url, error = %err, "Dropping directory connection");
        self.connection.lock().await.take();
        DirectoryError::Connection {
            msg: err.to_string(),
        }
    }

    fn check(result: LdapResult, dn: &str) -> DirectoryResult<()> {
        if result.rc == 0 {
            Ok(())
        } else {
            Err(DirectoryError::from_result_code(result.rc, dn, &result.text))
        }
    }

    fn value_set(values: &[String]) -> HashSet<String> {
        values.iter().cloned().collect()
    }
}

#[async_trait]
impl DirectoryClient for LdapDirectory {
    async fn search(&self, base: &str, scope: Scope, filter: &str) -> DirectoryResult<Vec<Entry>> {
        let mut ldap = self.connection().await?;
        let scope = match scope {
            Scope::Base => ldap3::Scope::Base,
            Scope::One => ldap3::Scope::OneLevel,
            Scope::Subtree => ldap3::Scope::Subtree,
        };
        let result = match ldap.search(base, scope, filter, vec!["*"]).await {
            Ok(result) => result,
            Err(e) => return Err(self.invalidate(e).await),
        };
        let ldap3::SearchResult(raw, status) = result;
        match status.rc {
            0 => {}
            32 => return Ok(Vec::new()),
            _ => return Err(DirectoryError::from_result_code(status.rc, base, &status.text)),
        }
        Ok(raw
            .into_iter()
            .map(|re| {
                let se = SearchEntry::construct(re);
                let mut entry = Entry::new(se.dn);
                for (name, values) in se.attrs {
                    entry.set(&name, values);
                }
                entry
            })
            .collect())
    }

    async fn add(&self, entry: &Entry) -> DirectoryResult<()> {
        let mut ldap = self.connection().await?;
        let attrs: Vec<(String, HashSet<String>)> = entry
            .attrs
            .iter()
            .map(|(name, values)| (name.clone(), Self::value_set(values)))
            .collect();
        match ldap.add(&entry.dn, attrs).await {
            Ok(result) => Self::check(result, &entry.dn),
            Err(e) => Err(self.invalidate(e).await),
        }
    }

    async fn modify(&self, dn: &str, changes: &[Modification]) -> DirectoryResult<()> {
        let mut ldap = self.connection().await?;
        let mods: Vec<Mod<String>> = changes
            .iter()
            .map(|m| {
                let values = Self::value_set(&m.values);
                match m.op {
                    ModOp::Add => Mod::Add(m.attr.clone(), values),
                    ModOp::Delete => Mod::Delete(m.attr.clone(), values),
                    ModOp::Replace => Mod::Replace(m.attr.clone(), values),
                }
            })
            .collect();
        match ldap.modify(dn, mods).await {
            Ok(result) => Self::check(result, dn),
            Err(e) => Err(self.invalidate(e).await),
        }
    }

    async fn delete(&self, dn: &str) -> DirectoryResult<()> {
        let mut ldap = self.connection().await?;
        match ldap.delete(dn).await {
            Ok(result) => Self::check(result, dn),
            Err(e) => Err(self.invalidate(e).await),
        }
    }

    async fn close(&self) {
        let taken = self.connection.lock().await.take();
        if let Some(mut ldap) = taken {
            if let Err(e) = ldap.unbind().await {
                warn!(error = %e, "Error during unbind");
            }
        }
    }
}
