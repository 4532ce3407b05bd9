//! `ldap3`-backed implementation of the directory client port
//!
//! ## Watermark discipline
//!
//! Every `open_*` call rebinds, reads the root identity attributes and
//! reconciles them against the caller's [`SyncContext`]: a changed
//! `invocationId` or DNS host name drops the USN lower bound to zero,
//! which is how "full sync required" is signalled to the caller. The
//! context leaves the call carrying the server-observed watermark; the
//! orchestrator persists it only once the whole cycle completed.

use adbridge_core::domain::entity::{AdGroup, AdUser};
use adbridge_core::domain::forest::Credentials;
use adbridge_core::domain::sync_context::SyncContext;
use adbridge_core::ports::{
    DirectoryError, DirectoryServerInfo, IDirectoryClient, IEntityPages,
};
use async_trait::async_trait;
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapError, Scope, SearchEntry, SearchStream};
use tracing::{debug, warn};

use crate::attrs::{
    self, guid_from_entry, group_from_entry, user_from_entry, AVATAR_ATTRS, DELETED_ATTRS,
    GROUP_ATTRS, USER_ATTRS,
};
use crate::bind_error::{generic_bind_error, parse_extended_bind_error};
use crate::controls;
use crate::filter;

/// LDAP result code for invalidCredentials
const RC_INVALID_CREDENTIALS: u32 = 49;

/// Root-DSE attributes read on every rebind
const ROOT_DSE_ATTRS: &[&str] = &[
    "dnsHostName",
    "highestCommittedUSN",
    "defaultNamingContext",
    "dsServiceName",
];

fn map_ldap_error(err: LdapError) -> DirectoryError {
    match err {
        LdapError::Io { source } => DirectoryError::ServerUnreachable(source.to_string()),
        LdapError::LdapResult { result } if result.rc == RC_INVALID_CREDENTIALS => {
            let detail = parse_extended_bind_error(&result.text)
                .unwrap_or_else(|| generic_bind_error(&result.text));
            DirectoryError::InvalidCredentials(detail)
        }
        other => DirectoryError::Protocol(other.to_string()),
    }
}

/// Directory client over `ldap3`
///
/// The scheme is configurable so tests and non-TLS labs can point the
/// client at plain `ldap://`; production deployments use the default.
pub struct LdapDirectoryClient {
    scheme: String,
}

impl Default for LdapDirectoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LdapDirectoryClient {
    pub fn new() -> Self {
        Self {
            scheme: "ldap".to_string(),
        }
    }

    /// Overrides the URL scheme (`ldap` or `ldaps`)
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    fn url_for(&self, host: &str) -> String {
        format!("{}://{}", self.scheme, host)
    }

    /// Connects and binds with the service account
    async fn bind(&self, credentials: &Credentials) -> Result<Ldap, DirectoryError> {
        let url = self.url_for(&credentials.host);
        debug!(url = %url, user = %credentials.user_name, "Binding to directory");

        let (conn, mut ldap) = LdapConnAsync::new(&url).await.map_err(map_ldap_error)?;
        ldap3::drive!(conn);

        let result = ldap
            .simple_bind(&credentials.user_name, &credentials.password)
            .await
            .map_err(map_ldap_error)?;

        match result.rc {
            0 => Ok(ldap),
            RC_INVALID_CREDENTIALS => {
                let detail = parse_extended_bind_error(&result.text)
                    .unwrap_or_else(|| generic_bind_error(&result.text));
                warn!(code = detail.code, symbolic = %detail.symbolic, "Bind rejected");
                Err(DirectoryError::InvalidCredentials(detail))
            }
            rc => Err(DirectoryError::Protocol(format!(
                "bind failed with result code {rc}: {}",
                result.text
            ))),
        }
    }

    /// Reads the server identity attributes from the root DSE, following
    /// `dsServiceName` to the NTDS settings object for the invocation id
    async fn read_root(ldap: &mut Ldap) -> Result<DirectoryServerInfo, DirectoryError> {
        let attrs: Vec<String> = ROOT_DSE_ATTRS.iter().map(|s| s.to_string()).collect();
        let (entries, _res) = ldap
            .search("", Scope::Base, "(objectClass=*)", attrs)
            .await
            .map_err(map_ldap_error)?
            .success()
            .map_err(map_ldap_error)?;

        let root = entries
            .into_iter()
            .next()
            .map(SearchEntry::construct)
            .ok_or_else(|| DirectoryError::Protocol("empty root DSE response".to_string()))?;

        let single = |attr: &str| -> String {
            root.attrs
                .get(attr)
                .and_then(|v| v.first())
                .cloned()
                .unwrap_or_default()
        };

        let mut info = DirectoryServerInfo {
            dns_host_name: single("dnsHostName"),
            invocation_id: String::new(),
            highest_committed_usn: single("highestCommittedUSN"),
            default_naming_context: single("defaultNamingContext"),
        };

        let ds_service_name = single("dsServiceName");
        if !ds_service_name.is_empty() {
            let (entries, _res) = ldap
                .search(
                    &ds_service_name,
                    Scope::Base,
                    "(objectClass=*)",
                    vec!["invocationId".to_string()],
                )
                .await
                .map_err(map_ldap_error)?
                .success()
                .map_err(map_ldap_error)?;

            if let Some(entry) = entries.into_iter().next().map(SearchEntry::construct) {
                if let Some(values) = entry.bin_attrs.get("invocationId") {
                    if let Some(bytes) = values.first() {
                        info.invocation_id = attrs::format_guid(bytes).unwrap_or_default();
                    }
                }
                if info.invocation_id.is_empty() {
                    info.invocation_id = entry
                        .attrs
                        .get("invocationId")
                        .and_then(|v| v.first())
                        .cloned()
                        .unwrap_or_default();
                }
            }
        }

        debug!(
            dns = %info.dns_host_name,
            usn = %info.highest_committed_usn,
            "Read directory root"
        );
        Ok(info)
    }

    /// Reconciles the stored context with the observed server identity and
    /// returns the USN lower bound for the next search. A changed
    /// invocation id or DNS name invalidates the watermark.
    fn reconcile(ctx: &mut SyncContext, info: &DirectoryServerInfo) -> i64 {
        let mut lower_bound: i64 = ctx.highest_committed_usn.parse().unwrap_or(0);

        let invocation_changed =
            !ctx.invocation_id.is_empty() && ctx.invocation_id != info.invocation_id;
        let dns_changed = !ctx.dc_dns_name.is_empty() && ctx.dc_dns_name != info.dns_host_name;
        if invocation_changed || dns_changed {
            debug!(
                previous = %ctx.invocation_id,
                current = %info.invocation_id,
                "Server identity changed, doing a full sync"
            );
            lower_bound = 0;
        }

        ctx.invocation_id = info.invocation_id.clone();
        ctx.dc_dns_name = info.dns_host_name.clone();
        ctx.highest_committed_usn = info.highest_committed_usn.clone();

        lower_bound
    }
}

type EntityMapper<T> = fn(&SearchEntry) -> Option<T>;

/// One open paged search; dropping it abandons the stream and releases the
/// connection
struct LdapEntityPages<T> {
    // Held so the connection outlives the stream
    _ldap: Ldap,
    stream: SearchStream<'static, String, Vec<String>>,
    page_size: usize,
    map: EntityMapper<T>,
    done: bool,
}

#[async_trait]
impl<T: Send + 'static> IEntityPages<T> for LdapEntityPages<T> {
    async fn next_page(&mut self) -> Result<Option<Vec<T>>, DirectoryError> {
        if self.done {
            return Ok(None);
        }

        let mut page = Vec::with_capacity(self.page_size);
        loop {
            match self.stream.next().await {
                Ok(Some(raw)) => {
                    let entry = SearchEntry::construct(raw);
                    if let Some(item) = (self.map)(&entry) {
                        page.push(item);
                        if page.len() >= self.page_size {
                            return Ok(Some(page));
                        }
                    } else {
                        warn!(dn = %entry.dn, "Skipping entry without objectGUID");
                    }
                }
                Ok(None) => {
                    self.done = true;
                    let result = self.stream.finish().await;
                    if result.rc != 0 {
                        return Err(DirectoryError::Protocol(format!(
                            "search ended with result code {}: {}",
                            result.rc, result.text
                        )));
                    }
                    return if page.is_empty() { Ok(None) } else { Ok(Some(page)) };
                }
                Err(e) => return Err(map_ldap_error(e)),
            }
        }
    }
}

fn string_attrs(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn paging_adapters(
    page_size: u32,
) -> Vec<Box<dyn Adapter<'static, String, Vec<String>>>> {
    vec![
        Box::new(EntriesOnly::new()),
        Box::new(PagedResults::new(page_size as i32)),
    ]
}

#[async_trait]
impl IDirectoryClient for LdapDirectoryClient {
    async fn server_info(
        &self,
        credentials: &Credentials,
    ) -> Result<DirectoryServerInfo, DirectoryError> {
        let mut ldap = self.bind(credentials).await?;
        let info = Self::read_root(&mut ldap).await?;
        let _ = ldap.unbind().await;
        Ok(info)
    }

    async fn open_group_search(
        &self,
        credentials: &Credentials,
        page_size: u32,
        filter: &str,
        ctx: &mut SyncContext,
    ) -> Result<Box<dyn IEntityPages<AdGroup>>, DirectoryError> {
        let mut ldap = self.bind(credentials).await?;
        let info = Self::read_root(&mut ldap).await?;
        let lower_bound = Self::reconcile(ctx, &info);
        let joined = filter::join_with_usn_lower_bound(filter, lower_bound)?;
        debug!(filter = %joined, "Opening group search");

        let stream = ldap
            .with_controls(controls::sort_by_usn_changed())
            .streaming_search_with(
                paging_adapters(page_size),
                &info.default_naming_context,
                Scope::Subtree,
                &joined,
                string_attrs(GROUP_ATTRS),
            )
            .await
            .map_err(map_ldap_error)?;

        Ok(Box::new(LdapEntityPages {
            _ldap: ldap,
            stream,
            page_size: page_size as usize,
            map: group_from_entry as EntityMapper<AdGroup>,
            done: false,
        }))
    }

    async fn open_user_search(
        &self,
        credentials: &Credentials,
        page_size: u32,
        filter: &str,
        ctx: &mut SyncContext,
        include_avatars: bool,
    ) -> Result<Box<dyn IEntityPages<AdUser>>, DirectoryError> {
        let mut ldap = self.bind(credentials).await?;
        let info = Self::read_root(&mut ldap).await?;
        let lower_bound = Self::reconcile(ctx, &info);
        let joined = filter::join_with_usn_lower_bound(filter, lower_bound)?;
        debug!(filter = %joined, include_avatars, "Opening user search");

        let mut attr_names = string_attrs(USER_ATTRS);
        if include_avatars {
            attr_names.extend(string_attrs(AVATAR_ATTRS));
        }

        let stream = ldap
            .with_controls(controls::sort_by_usn_changed())
            .streaming_search_with(
                paging_adapters(page_size),
                &info.default_naming_context,
                Scope::Subtree,
                &joined,
                attr_names,
            )
            .await
            .map_err(map_ldap_error)?;

        Ok(Box::new(LdapEntityPages {
            _ldap: ldap,
            stream,
            page_size: page_size as usize,
            map: user_from_entry as EntityMapper<AdUser>,
            done: false,
        }))
    }

    async fn open_deleted_user_search(
        &self,
        credentials: &Credentials,
        page_size: u32,
        ctx: &mut SyncContext,
    ) -> Result<Box<dyn IEntityPages<String>>, DirectoryError> {
        let mut ldap = self.bind(credentials).await?;
        let info = Self::read_root(&mut ldap).await?;

        let lower_bound = ctx.usn_value();
        let search_filter = filter::deleted_users_filter(lower_bound);
        let base = format!("CN=Deleted Objects,{}", info.default_naming_context);
        debug!(base = %base, filter = %search_filter, "Opening tombstone scan");

        ctx.invocation_id = info.invocation_id.clone();
        ctx.dc_dns_name = info.dns_host_name.clone();
        ctx.highest_committed_usn = info.highest_committed_usn.clone();

        let stream = ldap
            .with_controls(controls::show_deleted())
            .streaming_search_with(
                paging_adapters(page_size),
                &base,
                Scope::OneLevel,
                &search_filter,
                string_attrs(DELETED_ATTRS),
            )
            .await
            .map_err(map_ldap_error)?;

        Ok(Box::new(LdapEntityPages {
            _ldap: ldap,
            stream,
            page_size: page_size as usize,
            map: guid_from_entry as EntityMapper<String>,
            done: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_keeps_watermark_on_same_identity() {
        let mut ctx = SyncContext::new("F1", "dc1");
        ctx.invocation_id = "inv-1".to_string();
        ctx.dc_dns_name = "dc1.example.com".to_string();
        ctx.highest_committed_usn = "500".to_string();

        let info = DirectoryServerInfo {
            dns_host_name: "dc1.example.com".to_string(),
            invocation_id: "inv-1".to_string(),
            highest_committed_usn: "650".to_string(),
            default_naming_context: "DC=example,DC=com".to_string(),
        };

        let lower = LdapDirectoryClient::reconcile(&mut ctx, &info);
        assert_eq!(lower, 500);
        // The context now carries the server-observed watermark
        assert_eq!(ctx.highest_committed_usn, "650");
    }

    #[test]
    fn test_reconcile_resets_on_invocation_change() {
        let mut ctx = SyncContext::new("F1", "dc1");
        ctx.invocation_id = "inv-1".to_string();
        ctx.dc_dns_name = "dc1.example.com".to_string();
        ctx.highest_committed_usn = "500".to_string();

        let info = DirectoryServerInfo {
            dns_host_name: "dc1.example.com".to_string(),
            invocation_id: "inv-2".to_string(),
            highest_committed_usn: "650".to_string(),
            default_naming_context: "DC=example,DC=com".to_string(),
        };

        let lower = LdapDirectoryClient::reconcile(&mut ctx, &info);
        assert_eq!(lower, 0);
        assert_eq!(ctx.invocation_id, "inv-2");
    }

    #[test]
    fn test_reconcile_empty_context_starts_from_zero() {
        let mut ctx = SyncContext::new("F1", "dc1");
        let info = DirectoryServerInfo {
            dns_host_name: "dc1.example.com".to_string(),
            invocation_id: "inv-1".to_string(),
            highest_committed_usn: "650".to_string(),
            default_naming_context: "DC=example,DC=com".to_string(),
        };

        let lower = LdapDirectoryClient::reconcile(&mut ctx, &info);
        assert_eq!(lower, 0);
        assert_eq!(ctx.dc_dns_name, "dc1.example.com");
    }
}
