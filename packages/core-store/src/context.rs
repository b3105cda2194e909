//! Request contexts: parsed path+query addresses.
//!
//! Every view acquisition starts from an address such as
//! `/orders?view=map&keyType=String&valueType=Long&putReturnsNull=true`.
//! [`RequestContext::parse`] turns it into a descriptor carrying the target
//! path, the requested [`ViewType`], the element types and the typed options.
//! Unrecognized query keys are ignored so that newer clients can talk to
//! older servers.
//!
//! A context can be sealed. After [`RequestContext::seal`] every setter fails
//! with [`Error::Sealed`]; the tree seals contexts before handing them to view
//! factories.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Path, Result};

/// The capability a view provides.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViewType {
    Store,
    Map,
    KeySet,
    Values,
    EntrySet,
    Subscription,
    Reference,
    Publisher,
    Replication,
    Topology,
}

impl ViewType {
    /// Parse a view name. Names are case-insensitive and accept aliases.
    pub fn parse(name: &str) -> Result<Self> {
        let view = match name.to_ascii_lowercase().as_str() {
            "store" | "keyvaluestore" | "kvstore" => ViewType::Store,
            "map" | "mapview" => ViewType::Map,
            "keyset" => ViewType::KeySet,
            "values" => ViewType::Values,
            "entryset" => ViewType::EntrySet,
            "subscription" => ViewType::Subscription,
            "reference" | "ref" => ViewType::Reference,
            "publisher" | "pub" | "topicpublisher" | "topicpub" => ViewType::Publisher,
            "replication" => ViewType::Replication,
            "topology" | "topologysubscription" => ViewType::Topology,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "Unknown view name:{}",
                    name
                )))
            }
        };
        Ok(view)
    }

    /// The canonical name used in rendered addresses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewType::Store => "store",
            ViewType::Map => "map",
            ViewType::KeySet => "keySet",
            ViewType::Values => "values",
            ViewType::EntrySet => "entrySet",
            ViewType::Subscription => "subscription",
            ViewType::Reference => "reference",
            ViewType::Publisher => "publisher",
            ViewType::Replication => "replication",
            ViewType::Topology => "topology",
        }
    }

    /// Whether this view is one of the bulk collection views of a map.
    pub fn is_collection(&self) -> bool {
        matches!(self, ViewType::KeySet | ViewType::Values | ViewType::EntrySet)
    }
}

impl fmt::Display for ViewType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_TYPE: &str = "String";
const DEFAULT_CLUSTER: &str = "cluster";

/// A parsed, optionally sealed, address of a view.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestContext {
    path: Path,
    view_type: Option<ViewType>,
    key_type: Option<String>,
    value_type: Option<String>,
    put_returns_null: Option<bool>,
    remove_returns_null: Option<bool>,
    null_old_value_on_update_event: Option<bool>,
    bootstrap: Option<bool>,
    end_subscription_after_bootstrap: Option<bool>,
    base_path: Option<String>,
    entries: u64,
    average_value_size: f64,
    cluster: Option<String>,
    sealed: bool,
}

impl RequestContext {
    /// A context for `path` with every option at its default.
    pub fn new(path: Path) -> Self {
        Self {
            path,
            view_type: None,
            key_type: None,
            value_type: None,
            put_returns_null: None,
            remove_returns_null: None,
            null_old_value_on_update_event: None,
            bootstrap: None,
            end_subscription_after_bootstrap: None,
            base_path: None,
            entries: 0,
            average_value_size: 0.0,
            cluster: None,
            sealed: false,
        }
    }

    /// Parse a path+query address.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use kvtree_core_store::{RequestContext, ViewType};
    ///
    /// let ctx =
    ///     RequestContext::parse("/orders/?view=Map&valueType=Long&bootstrap=false").unwrap();
    /// assert_eq!(ctx.full_name(), "orders");
    /// assert_eq!(ctx.view_type(), Some(ViewType::Map));
    /// assert_eq!(ctx.key_type(), "String");
    /// assert_eq!(ctx.value_type(), "Long");
    /// assert!(!ctx.bootstrap());
    /// ```
    pub fn parse(uri: &str) -> Result<Self> {
        let (full_name, query) = match uri.find('?') {
            Some(pos) => (&uri[..pos], &uri[pos + 1..]),
            None => (uri, ""),
        };
        let mut ctx = RequestContext::new(Path::parse(full_name)?);
        ctx.apply_query(query)?;
        Ok(ctx)
    }

    /// Apply the options of a query string (without the leading `?`).
    pub fn apply_query(&mut self, query: &str) -> Result<&mut Self> {
        self.check_sealed()?;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = value.as_ref();
            match key.as_ref() {
                "view" | "viewType" => self.view_type = Some(ViewType::parse(value)?),
                "keyType" | "topicType" | "elementType" => self.key_type = Some(value.to_string()),
                "valueType" | "messageType" => self.value_type = Some(value.to_string()),
                "putReturnsNull" => self.put_returns_null = Some(parse_bool(&key, value)?),
                "removeReturnsNull" => self.remove_returns_null = Some(parse_bool(&key, value)?),
                "nullOldValueOnUpdateEvent" => {
                    self.null_old_value_on_update_event = Some(parse_bool(&key, value)?)
                }
                "bootstrap" => self.bootstrap = Some(parse_bool(&key, value)?),
                "endSubscriptionAfterBootstrap" => {
                    self.end_subscription_after_bootstrap = Some(parse_bool(&key, value)?)
                }
                "basePath" => self.base_path = Some(value.to_string()),
                "entries" => {
                    self.entries = value.parse().map_err(|_| {
                        Error::invalid_argument(format!("entries must be a count: {}", value))
                    })?
                }
                "averageValueSize" => {
                    self.average_value_size = value.parse().map_err(|_| {
                        Error::invalid_argument(format!(
                            "averageValueSize must be a number: {}",
                            value
                        ))
                    })?
                }
                "cluster" => self.cluster = Some(value.to_string()),
                other => tracing::trace!(option = other, "ignoring unrecognized query option"),
            }
        }
        Ok(self)
    }

    /// Make this context immutable.
    pub fn seal(mut self) -> Self {
        self.sealed = true;
        self
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn check_sealed(&self) -> Result<()> {
        if self.sealed {
            Err(Error::Sealed)
        } else {
            Ok(())
        }
    }

    /// A sealed copy of this context addressing a different view of the same
    /// path. Wrapping view factories use this to acquire what they wrap.
    pub fn for_view(&self, view: ViewType) -> Self {
        let mut ctx = self.clone();
        ctx.view_type = Some(view);
        ctx.sealed = true;
        ctx
    }

    /// A sealed copy of this context addressing another path.
    pub fn for_path(&self, path: Path) -> Self {
        let mut ctx = self.clone();
        ctx.path = path;
        ctx.sealed = true;
        ctx
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The leaf name, empty for the root.
    pub fn name(&self) -> &str {
        self.path.name().unwrap_or("")
    }

    /// The parent path rendered as a string, empty for top-level names.
    pub fn name_path(&self) -> String {
        self.path.parent().map(|p| p.to_string()).unwrap_or_default()
    }

    /// The full path without a leading slash.
    pub fn full_name(&self) -> String {
        self.path.to_string()
    }

    pub fn view_type(&self) -> Option<ViewType> {
        self.view_type
    }

    pub fn key_type(&self) -> &str {
        self.key_type.as_deref().unwrap_or(DEFAULT_TYPE)
    }

    pub fn value_type(&self) -> &str {
        self.value_type.as_deref().unwrap_or(DEFAULT_TYPE)
    }

    pub fn topic_type(&self) -> &str {
        self.key_type()
    }

    pub fn message_type(&self) -> &str {
        self.value_type()
    }

    /// The declared element type: the value type when set, else the key type.
    pub fn element_type(&self) -> &str {
        self.value_type
            .as_deref()
            .or(self.key_type.as_deref())
            .unwrap_or(DEFAULT_TYPE)
    }

    pub fn put_returns_null(&self) -> bool {
        self.put_returns_null.unwrap_or(false)
    }

    pub fn remove_returns_null(&self) -> bool {
        self.remove_returns_null.unwrap_or(false)
    }

    pub fn null_old_value_on_update_event(&self) -> bool {
        self.null_old_value_on_update_event.unwrap_or(false)
    }

    /// Whether a new subscriber first receives the current contents.
    pub fn bootstrap(&self) -> bool {
        self.bootstrap.unwrap_or(true)
    }

    pub fn end_subscription_after_bootstrap(&self) -> bool {
        self.end_subscription_after_bootstrap.unwrap_or(false)
    }

    pub fn base_path(&self) -> Option<&str> {
        self.base_path.as_deref()
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn average_value_size(&self) -> f64 {
        self.average_value_size
    }

    pub fn cluster(&self) -> &str {
        self.cluster.as_deref().unwrap_or(DEFAULT_CLUSTER)
    }

    /// The qualifier that distinguishes several views of one capability on a
    /// node. Only replication views are qualified, by cluster name.
    pub fn qualifier(&self) -> Option<&str> {
        match self.view_type {
            Some(ViewType::Replication) => Some(self.cluster()),
            _ => None,
        }
    }

    pub fn set_view_type(&mut self, view: ViewType) -> Result<&mut Self> {
        self.check_sealed()?;
        self.view_type = Some(view);
        Ok(self)
    }

    pub fn set_key_type(&mut self, name: &str) -> Result<&mut Self> {
        self.check_sealed()?;
        self.key_type = Some(name.to_string());
        Ok(self)
    }

    pub fn set_value_type(&mut self, name: &str) -> Result<&mut Self> {
        self.check_sealed()?;
        self.value_type = Some(name.to_string());
        Ok(self)
    }

    pub fn set_put_returns_null(&mut self, flag: bool) -> Result<&mut Self> {
        self.check_sealed()?;
        self.put_returns_null = Some(flag);
        Ok(self)
    }

    pub fn set_remove_returns_null(&mut self, flag: bool) -> Result<&mut Self> {
        self.check_sealed()?;
        self.remove_returns_null = Some(flag);
        Ok(self)
    }

    pub fn set_bootstrap(&mut self, flag: bool) -> Result<&mut Self> {
        self.check_sealed()?;
        self.bootstrap = Some(flag);
        Ok(self)
    }

    pub fn set_end_subscription_after_bootstrap(&mut self, flag: bool) -> Result<&mut Self> {
        self.check_sealed()?;
        self.end_subscription_after_bootstrap = Some(flag);
        Ok(self)
    }

    pub fn set_base_path(&mut self, base_path: &str) -> Result<&mut Self> {
        self.check_sealed()?;
        self.base_path = Some(base_path.to_string());
        Ok(self)
    }

    pub fn set_entries(&mut self, entries: u64) -> Result<&mut Self> {
        self.check_sealed()?;
        self.entries = entries;
        Ok(self)
    }

    pub fn set_average_value_size(&mut self, size: f64) -> Result<&mut Self> {
        self.check_sealed()?;
        self.average_value_size = size;
        Ok(self)
    }

    pub fn set_cluster(&mut self, cluster: &str) -> Result<&mut Self> {
        self.check_sealed()?;
        self.cluster = Some(cluster.to_string());
        Ok(self)
    }

    /// Render back to an address. Options left at their defaults are omitted.
    pub fn to_uri(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(view) = self.view_type {
            query.append_pair("view", view.as_str());
        }
        if let Some(key_type) = &self.key_type {
            query.append_pair("keyType", key_type);
        }
        if let Some(value_type) = &self.value_type {
            query.append_pair("valueType", value_type);
        }
        let flags = [
            ("putReturnsNull", self.put_returns_null),
            ("removeReturnsNull", self.remove_returns_null),
            ("nullOldValueOnUpdateEvent", self.null_old_value_on_update_event),
            ("bootstrap", self.bootstrap),
            (
                "endSubscriptionAfterBootstrap",
                self.end_subscription_after_bootstrap,
            ),
        ];
        for (name, flag) in flags {
            if let Some(flag) = flag {
                query.append_pair(name, if flag { "true" } else { "false" });
            }
        }
        if let Some(base_path) = &self.base_path {
            query.append_pair("basePath", base_path);
        }
        if self.entries != 0 {
            query.append_pair("entries", &self.entries.to_string());
        }
        if self.average_value_size != 0.0 {
            query.append_pair("averageValueSize", &self.average_value_size.to_string());
        }
        if let Some(cluster) = &self.cluster {
            query.append_pair("cluster", cluster);
        }

        let query = query.finish();
        if query.is_empty() {
            self.path.to_absolute()
        } else {
            format!("{}?{}", self.path.to_absolute(), query)
        }
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(Error::invalid_argument(format!(
            "{} must be a boolean: {}",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;

    #[test]
    fn parse_path_and_name() {
        let ctx = RequestContext::parse("/group/subject").unwrap();
        assert_eq!(ctx.path(), &path!("group/subject"));
        assert_eq!(ctx.name(), "subject");
        assert_eq!(ctx.name_path(), "group");
        assert_eq!(ctx.view_type(), None);
    }

    #[test]
    fn trailing_slash_is_stripped() {
        let ctx = RequestContext::parse("orders/?view=map").unwrap();
        assert_eq!(ctx.full_name(), "orders");
        assert_eq!(ctx.name(), "orders");
        assert_eq!(ctx.name_path(), "");
    }

    #[test]
    fn type_aliases() {
        let ctx = RequestContext::parse("t?topicType=Integer&messageType=Boolean").unwrap();
        assert_eq!(ctx.key_type(), "Integer");
        assert_eq!(ctx.topic_type(), "Integer");
        assert_eq!(ctx.value_type(), "Boolean");

        let ctx = RequestContext::parse("s?elementType=Long").unwrap();
        assert_eq!(ctx.element_type(), "Long");
        assert_eq!(ctx.value_type(), "String");
    }

    #[test]
    fn flags_and_hints() {
        let ctx = RequestContext::parse(
            "m?putReturnsNull=true&removeReturnsNull=true&nullOldValueOnUpdateEvent=true\
             &endSubscriptionAfterBootstrap=true&entries=5000&averageValueSize=128.5\
             &basePath=/data/m",
        )
        .unwrap();
        assert!(ctx.put_returns_null());
        assert!(ctx.remove_returns_null());
        assert!(ctx.null_old_value_on_update_event());
        assert!(ctx.end_subscription_after_bootstrap());
        assert!(ctx.bootstrap());
        assert_eq!(ctx.entries(), 5000);
        assert_eq!(ctx.average_value_size(), 128.5);
        assert_eq!(ctx.base_path(), Some("/data/m"));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let ctx = RequestContext::parse("m?view=map&shinyNewOption=42").unwrap();
        assert_eq!(ctx.view_type(), Some(ViewType::Map));
    }

    #[test]
    fn unknown_view_is_rejected() {
        let err = RequestContext::parse("m?view=spreadsheet").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn bad_flag_is_rejected() {
        assert!(RequestContext::parse("m?bootstrap=maybe").is_err());
    }

    #[test]
    fn sealed_context_rejects_setters() {
        let mut ctx = RequestContext::parse("m").unwrap();
        ctx.set_put_returns_null(true).unwrap();

        let mut sealed = ctx.seal();
        assert!(sealed.is_sealed());
        assert!(matches!(sealed.set_entries(10), Err(Error::Sealed)));
        assert!(matches!(sealed.apply_query("view=map"), Err(Error::Sealed)));
        assert!(sealed.put_returns_null());
    }

    #[test]
    fn for_view_keeps_options() {
        let ctx = RequestContext::parse("m?view=map&valueType=Long").unwrap();
        let store = ctx.for_view(ViewType::Store);
        assert_eq!(store.view_type(), Some(ViewType::Store));
        assert_eq!(store.value_type(), "Long");
        assert!(store.is_sealed());
    }

    #[test]
    fn uri_round_trip() {
        let uri = "/orders?view=keySet&keyType=String&valueType=Long&bootstrap=false";
        let ctx = RequestContext::parse(uri).unwrap();
        assert_eq!(ctx.to_uri(), uri);
        assert_eq!(RequestContext::parse(&ctx.to_uri()).unwrap(), ctx);
        assert_eq!(RequestContext::parse("a/b").unwrap().to_uri(), "/a/b");
    }

    #[test]
    fn replication_views_are_qualified_by_cluster() {
        let ctx = RequestContext::parse("m?view=replication&cluster=emea").unwrap();
        assert_eq!(ctx.qualifier(), Some("emea"));
        let ctx = RequestContext::parse("m?view=replication").unwrap();
        assert_eq!(ctx.qualifier(), Some("cluster"));
        let ctx = RequestContext::parse("m?view=map&cluster=emea").unwrap();
        assert_eq!(ctx.qualifier(), None);
    }

    #[test]
    fn percent_decoding() {
        let ctx = RequestContext::parse("m?basePath=%2Fdata%20dir").unwrap();
        assert_eq!(ctx.base_path(), Some("/data dir"));
    }
}
