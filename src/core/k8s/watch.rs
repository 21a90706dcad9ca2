// src/core/k8s/watch.rs

//! Thin wrapper over `kube::runtime::watcher` giving callers a typed stream
//! of applied/deleted objects that transparently re-lists on `410 Gone` or
//! `resourceVersion` expiry, matching the "re-list + resume" contract the
//! rest of the controller relies on.

use futures::{Stream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::api::ListParams;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, Resource};
use std::fmt::Debug;
use tracing::warn;

/// An object either observed present (created or updated) or observed
/// removed. Collapsing `watcher::Event`'s `Init`/`InitApply`/`Apply` stream
/// variants down to this shape keeps every caller's fold logic identical
/// regardless of whether the event came from the initial list or a live
/// watch tick.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
}

/// Watches every object of kind `K` in `namespace` matching `label_selector`,
/// yielding a flattened stream of `WatchEvent`s. Internally this is a
/// `kube::runtime::watcher` in its default (list-then-watch, re-list on
/// desync) mode; callers never see the distinction between the initial
/// list and subsequent watch events.
pub fn watch_namespaced<K>(
    client: Client,
    namespace: &str,
    label_selector: Option<String>,
) -> impl Stream<Item = WatchEvent<K>>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + 'static
        + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client, namespace);
    let mut params = watcher::Config::default();
    if let Some(selector) = label_selector {
        params = params.labels(&selector);
    }

    watcher::watcher(api, params).filter_map(|result| async move {
        match result {
            Ok(Event::Apply(obj)) => Some(WatchEvent::Applied(obj)),
            Ok(Event::Delete(obj)) => Some(WatchEvent::Deleted(obj)),
            Ok(Event::Init) | Ok(Event::InitApply(_)) | Ok(Event::InitDone) => None,
            Err(e) => {
                warn!("watch stream error, relying on watcher's internal re-list: {}", e);
                None
            }
        }
    })
}

/// Same as [`watch_namespaced`] but across every namespace, used for the
/// cluster-scoped Node watch feeding the node cache view.
pub fn watch_cluster<K>(client: Client, label_selector: Option<String>) -> impl Stream<Item = WatchEvent<K>>
where
    K: Resource<Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + 'static
        + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::all(client);
    let mut params = watcher::Config::default();
    if let Some(selector) = label_selector {
        params = params.labels(&selector);
    }

    watcher::watcher(api, params).filter_map(|result| async move {
        match result {
            Ok(Event::Apply(obj)) => Some(WatchEvent::Applied(obj)),
            Ok(Event::Delete(obj)) => Some(WatchEvent::Deleted(obj)),
            Ok(Event::Init) | Ok(Event::InitApply(_)) | Ok(Event::InitDone) => None,
            Err(e) => {
                warn!("watch stream error, relying on watcher's internal re-list: {}", e);
                None
            }
        }
    })
}

/// Lists every object of kind `K` in `namespace`, used by reconciliation
/// passes that need a one-shot snapshot rather than a live stream.
pub async fn list_namespaced<K>(
    client: Client,
    namespace: &str,
    label_selector: Option<&str>,
) -> kube::Result<Vec<K>>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client, namespace);
    let mut params = ListParams::default();
    if let Some(selector) = label_selector {
        params = params.labels(selector);
    }
    Ok(api.list(&params).await?.items)
}
