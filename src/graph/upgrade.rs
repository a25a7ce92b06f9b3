//! Upgrade path queries
//!
//! skipRange is only ever consulted here, at query time. Stored edges come
//! from replaces and skips alone.

use semver::Version;
use std::collections::BTreeSet;

use super::{BundleId, PackageGraph};

/// Walk a channel from its head along replaces edges
pub fn replaces_chain(pkg: &PackageGraph, channel: &str) -> Vec<BundleId> {
    let Some(ch) = pkg.channel(channel) else {
        return Vec::new();
    };
    let mut chain = Vec::new();
    let mut seen = BTreeSet::new();
    let mut cursor = ch.head;
    while let Some(id) = cursor {
        if !seen.insert(id) {
            break;
        }
        chain.push(id);
        cursor = ch.replaces.get(&id).copied();
    }
    chain
}

/// Bundles in `channel` that an installation of `installed` (name and
/// version) can move to in one step
pub fn upgrade_targets(
    pkg: &PackageGraph,
    channel: &str,
    installed_name: &str,
    installed_version: &Version,
) -> Vec<BundleId> {
    let Some(ch) = pkg.channel(channel) else {
        return Vec::new();
    };
    let installed = pkg.live_bundle(installed_name);

    let mut targets: Vec<BundleId> = ch
        .members
        .iter()
        .copied()
        .filter(|&id| Some(id) != installed)
        .filter(|&id| {
            let b = pkg.bundle(id);
            let by_edge = installed
                .map(|from| {
                    ch.replaces.get(&id) == Some(&from) || ch.skips.contains(&(id, from))
                })
                .unwrap_or(false);
            let by_name = b.replaces.as_deref() == Some(installed_name)
                || b.skips.iter().any(|s| s == installed_name);
            let by_range = b
                .skip_range
                .as_ref()
                .map(|r| r.contains(installed_version))
                .unwrap_or(false);
            by_edge || by_name || by_range
        })
        .collect();
    targets.sort_by(|a, b| pkg.bundle(*b).version.cmp(&pkg.bundle(*a).version));
    targets
}

/// The replaces chain with every intermediate bundle dropped that the last
/// kept bundle can skip over, along with its predecessor.
///
/// Every kept bundle whose replaces target was dropped can still skip to
/// the next kept bundle, so importing the result bridges each gap.
pub fn minimal_chain(pkg: &PackageGraph, channel: &str) -> Vec<BundleId> {
    let chain = replaces_chain(pkg, channel);
    if chain.len() <= 2 {
        return chain;
    }

    let mut kept = vec![chain[0]];
    for window in chain.windows(2).skip(1) {
        let (current, next) = (window[0], window[1]);
        let last = pkg.bundle(*kept.last().unwrap_or(&chain[0]));
        if last.can_skip(pkg.bundle(current)) && last.can_skip(pkg.bundle(next)) {
            continue;
        }
        kept.push(current);
    }
    if let Some(tail) = chain.last() {
        kept.push(*tail);
    }
    kept
}

/// Every member reachable from the head through replaces or skips edges
pub fn reachable_members(pkg: &PackageGraph, channel: &str) -> Vec<BundleId> {
    let Some(ch) = pkg.channel(channel) else {
        return Vec::new();
    };
    let Some(head) = ch.head else {
        return Vec::new();
    };
    super::heads::ChannelView::build(ch)
        .reachable_from(head)
        .into_iter()
        .collect()
}
