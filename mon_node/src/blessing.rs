// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Blessing calculation.
//!
//! Given the merged global component list, decide which components hold a
//! grant to perform their active work. Components are partitioned by group
//! and each group is resolved independently by its configured algorithm.

use mon_interface::{Algorithm, BlessingReq, Cid, ComponentInfo, Mid};

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Process-wide grant token source. Strictly increasing across both
/// algorithms, so no two grants ever share a token.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Calculate blessing updates for the given global component list.
///
/// Returns the `(mid, cid, blessing_req)` triples whose request differs from
/// the component's current one; unchanged components are not emitted.
pub fn calculate(
    components: &[ComponentInfo],
    group_algorithms: &HashMap<String, Algorithm>,
    default_algorithm: Algorithm,
) -> Vec<(Mid, Cid, BlessingReq)> {
    let mut groups: HashMap<Option<&str>, Vec<&ComponentInfo>> = HashMap::new();
    for info in components {
        groups.entry(info.group.as_deref()).or_default().push(info);
    }

    let mut changes = Vec::new();
    for (group, members) in groups {
        let algorithm = group
            .and_then(|name| group_algorithms.get(name))
            .copied()
            .unwrap_or(default_algorithm);

        match algorithm {
            Algorithm::BlessAll => bless_all(&members, &mut changes),
            Algorithm::BlessOne => bless_one(&members, &mut changes),
        }
    }

    changes
}

fn next_blessing() -> BlessingReq {
    BlessingReq {
        token: Some(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)),
        timestamp: Some(now_timestamp()),
    }
}

fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

/// Every ready member runs: issue a grant to each ready component that does
/// not already hold one, clear the grant of each non-ready component.
fn bless_all(members: &[&ComponentInfo], changes: &mut Vec<(Mid, Cid, BlessingReq)>) {
    for info in members {
        let req = if !info.blessing_res.ready {
            BlessingReq::none()
        } else if info.blessing_req.is_blessed() {
            continue;
        } else {
            next_blessing()
        };

        if req != info.blessing_req {
            changes.push((info.mid, info.cid, req));
        }
    }
}

/// Single winner selection. Ready members compete on
/// (rank, already-blessed, grant age, mid); the round is abandoned while a
/// stale holder other than the winner has not yet released its token.
fn bless_one(members: &[&ComponentInfo], changes: &mut Vec<(Mid, Cid, BlessingReq)>) {
    let mut winner: Option<&ComponentInfo> = None;
    for info in members {
        if !info.blessing_res.ready {
            continue;
        }
        if winner.map_or(true, |current| beats(info, current)) {
            winner = Some(info);
        }
    }

    if let Some(chosen) = winner {
        let confirmed = chosen.blessing_req.token.is_some()
            && chosen.blessing_res.token == chosen.blessing_req.token;
        let other_holds = members.iter().any(|info| {
            (info.mid, info.cid) != (chosen.mid, chosen.cid) && info.blessing_res.token.is_some()
        });
        if !confirmed && other_holds {
            winner = None;
        }
    }

    for info in members {
        let is_winner =
            winner.map_or(false, |chosen| (chosen.mid, chosen.cid) == (info.mid, info.cid));

        if is_winner {
            if !info.blessing_req.is_blessed() {
                changes.push((info.mid, info.cid, next_blessing()));
            }
        } else if info.blessing_req != BlessingReq::none() {
            changes.push((info.mid, info.cid, BlessingReq::none()));
        }
    }
}

/// Whether `challenger` wins the highlander election over `current`.
fn beats(challenger: &ComponentInfo, current: &ComponentInfo) -> bool {
    if challenger.rank != current.rank {
        return challenger.rank < current.rank;
    }

    let challenger_blessed = challenger.blessing_req.is_blessed();
    let current_blessed = current.blessing_req.is_blessed();
    if challenger_blessed != current_blessed {
        return challenger_blessed;
    }

    if challenger_blessed && current_blessed {
        // Both timestamps are present per is_blessed.
        let challenger_ts = challenger.blessing_req.timestamp.unwrap_or_default();
        let current_ts = current.blessing_req.timestamp.unwrap_or_default();
        if challenger_ts != current_ts {
            return challenger_ts < current_ts;
        }
    }

    challenger.mid < current.mid
}

#[cfg(test)]
mod tests {
    use super::*;
    use mon_interface::BlessingRes;

    fn component(cid: Cid, mid: Mid, group: &str, rank: i64) -> ComponentInfo {
        ComponentInfo {
            cid,
            mid,
            name: Some(format!("c{cid}")),
            group: Some(group.to_string()),
            data: serde_json::Value::Null,
            rank,
            blessing_req: BlessingReq::none(),
            blessing_res: BlessingRes::default(),
        }
    }

    fn ready(mut info: ComponentInfo) -> ComponentInfo {
        info.blessing_res.ready = true;
        info
    }

    fn blessed(mut info: ComponentInfo, token: u64, timestamp: f64) -> ComponentInfo {
        info.blessing_req = BlessingReq {
            token: Some(token),
            timestamp: Some(timestamp),
        };
        info
    }

    fn echoed(mut info: ComponentInfo, token: u64) -> ComponentInfo {
        info.blessing_res.token = Some(token);
        info
    }

    /// Applies the emitted changes, mirroring what the master does.
    fn apply(
        components: &[ComponentInfo],
        changes: &[(Mid, Cid, BlessingReq)],
    ) -> Vec<ComponentInfo> {
        components
            .iter()
            .cloned()
            .map(|mut info| {
                if let Some((_, _, req)) = changes
                    .iter()
                    .find(|(mid, cid, _)| (*mid, *cid) == (info.mid, info.cid))
                {
                    info.blessing_req = *req;
                }
                info
            })
            .collect()
    }

    fn req_tokens(components: &[ComponentInfo]) -> Vec<Option<u64>> {
        components.iter().map(|i| i.blessing_req.token).collect()
    }

    #[test]
    fn empty_input_yields_no_changes() {
        let changes = calculate(&[], &HashMap::new(), Algorithm::BlessAll);
        assert!(changes.is_empty());
    }

    #[test]
    fn bless_all_grants_every_ready_component() {
        let components = vec![
            ready(component(1, 0, "g", 1)),
            ready(component(2, 0, "g", 1)),
            component(3, 0, "g", 1),
        ];

        let result = apply(
            &components,
            &calculate(&components, &HashMap::new(), Algorithm::BlessAll),
        );

        assert!(result[0].blessing_req.is_blessed());
        assert!(result[1].blessing_req.is_blessed());
        assert_eq!(result[2].blessing_req, BlessingReq::none());
        assert_ne!(result[0].blessing_req.token, result[1].blessing_req.token);
    }

    #[test]
    fn bless_all_keeps_existing_grants() {
        let components = vec![blessed(ready(component(1, 0, "g", 1)), 123, 2.0)];

        let changes = calculate(&components, &HashMap::new(), Algorithm::BlessAll);
        assert!(changes.is_empty());
    }

    #[test]
    fn bless_all_revokes_grant_when_ready_drops() {
        let components = vec![blessed(component(1, 0, "g", 1), 123, 2.0)];

        let changes = calculate(&components, &HashMap::new(), Algorithm::BlessAll);
        assert_eq!(changes, vec![(0, 1, BlessingReq::none())]);
    }

    #[test]
    fn bless_all_groups_are_independent() {
        let components = vec![
            ready(component(1, 0, "g1", 1)),
            component(2, 0, "g2", 1),
        ];

        let result = apply(
            &components,
            &calculate(&components, &HashMap::new(), Algorithm::BlessAll),
        );

        assert!(result[0].blessing_req.is_blessed());
        assert_eq!(result[1].blessing_req, BlessingReq::none());
    }

    #[test]
    fn bless_one_grants_a_single_component() {
        let components = vec![
            ready(component(1, 0, "g", 1)),
            ready(component(2, 0, "g", 1)),
        ];

        let result = apply(
            &components,
            &calculate(&components, &HashMap::new(), Algorithm::BlessOne),
        );

        assert!(result[0].blessing_req.is_blessed());
        assert_eq!(result[1].blessing_req, BlessingReq::none());
    }

    #[test]
    fn bless_one_prefers_lower_rank() {
        let components = vec![
            ready(component(1, 0, "g", 2)),
            ready(component(2, 0, "g", 1)),
        ];

        let result = apply(
            &components,
            &calculate(&components, &HashMap::new(), Algorithm::BlessOne),
        );

        assert_eq!(result[0].blessing_req, BlessingReq::none());
        assert!(result[1].blessing_req.is_blessed());
    }

    #[test]
    fn bless_one_keeps_current_holder_on_rank_tie() {
        let components = vec![
            ready(component(1, 0, "g", 1)),
            echoed(blessed(ready(component(2, 1, "g", 1)), 123, 2.0), 123),
        ];

        let changes = calculate(&components, &HashMap::new(), Algorithm::BlessOne);
        // The holder survives, the other stays without a grant; nothing to emit.
        assert!(changes.is_empty());
    }

    #[test]
    fn bless_one_prefers_older_grant_when_both_blessed() {
        let components = vec![
            blessed(ready(component(1, 0, "g", 1)), 5, 9.0),
            blessed(ready(component(2, 1, "g", 1)), 4, 3.0),
        ];

        let result = apply(
            &components,
            &calculate(&components, &HashMap::new(), Algorithm::BlessOne),
        );

        assert_eq!(result[0].blessing_req, BlessingReq::none());
        assert_eq!(result[1].blessing_req.token, Some(4));
    }

    #[test]
    fn bless_one_breaks_remaining_ties_by_mid() {
        let components = vec![
            ready(component(1, 2, "g", 1)),
            ready(component(1, 1, "g", 1)),
        ];

        let result = apply(
            &components,
            &calculate(&components, &HashMap::new(), Algorithm::BlessOne),
        );

        assert_eq!(result[0].blessing_req, BlessingReq::none());
        assert!(result[1].blessing_req.is_blessed());
    }

    #[test]
    fn bless_one_nobody_ready_nobody_blessed() {
        let components = vec![component(1, 0, "g", 1), component(2, 0, "g", 1)];

        let changes = calculate(&components, &HashMap::new(), Algorithm::BlessOne);
        assert!(changes.is_empty());
    }

    #[test]
    fn bless_one_abandons_round_while_old_holder_lingers() {
        // The previous holder still echoes token 7 although its grant was
        // reassigned away by a rank change; the new winner must not receive
        // a grant until the old holder releases.
        let components = vec![
            echoed(ready(component(1, 0, "g", 5)), 7),
            ready(component(2, 0, "g", 1)),
        ];

        let result = apply(
            &components,
            &calculate(&components, &HashMap::new(), Algorithm::BlessOne),
        );

        assert_eq!(req_tokens(&result), vec![None, None]);
    }

    #[test]
    fn bless_one_completes_election_after_holder_releases() {
        let components = vec![
            ready(component(1, 0, "g", 5)),
            ready(component(2, 0, "g", 1)),
        ];

        let result = apply(
            &components,
            &calculate(&components, &HashMap::new(), Algorithm::BlessOne),
        );

        assert_eq!(result[0].blessing_req, BlessingReq::none());
        assert!(result[1].blessing_req.is_blessed());
    }

    #[test]
    fn bless_one_reelects_after_holder_disappears() {
        // Only the survivor is left in the group; it gets a fresh grant even
        // though it previously lost the election.
        let components = vec![ready(component(2, 0, "g", 2))];

        let result = apply(
            &components,
            &calculate(&components, &HashMap::new(), Algorithm::BlessOne),
        );

        assert!(result[0].blessing_req.is_blessed());
    }

    #[test]
    fn bless_one_confirmed_winner_survives_lingering_token() {
        // The winner already echoed its own grant; a stale token elsewhere
        // must not revoke it.
        let components = vec![
            echoed(blessed(ready(component(1, 0, "g", 1)), 9, 1.0), 9),
            echoed(component(2, 0, "g", 1), 3),
        ];

        let changes = calculate(&components, &HashMap::new(), Algorithm::BlessOne);
        assert!(changes.is_empty());
    }

    #[test]
    fn group_algorithm_overrides_default() {
        let mut group_algorithms = HashMap::new();
        let _ = group_algorithms.insert("one".to_string(), Algorithm::BlessOne);

        let components = vec![
            ready(component(1, 0, "one", 1)),
            ready(component(2, 0, "one", 1)),
            ready(component(3, 0, "all", 1)),
            ready(component(4, 0, "all", 1)),
        ];

        let result = apply(
            &components,
            &calculate(&components, &group_algorithms, Algorithm::BlessAll),
        );

        assert!(result[0].blessing_req.is_blessed());
        assert_eq!(result[1].blessing_req, BlessingReq::none());
        assert!(result[2].blessing_req.is_blessed());
        assert!(result[3].blessing_req.is_blessed());
    }

    #[test]
    fn tokens_are_unique_across_calls_and_algorithms() {
        let all = vec![ready(component(1, 0, "g", 1))];
        let one = vec![ready(component(1, 1, "g", 1))];

        let mut tokens = Vec::new();
        for _ in 0..10 {
            for (mids, algorithm) in [(&all, Algorithm::BlessAll), (&one, Algorithm::BlessOne)] {
                for (_, _, req) in calculate(mids, &HashMap::new(), algorithm) {
                    tokens.extend(req.token);
                }
            }
        }

        let mut deduped = tokens.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(tokens.len(), deduped.len());
    }
}
