/*
 * Copyright (C) 2025 The Staticpod Operator Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::operator::k8s::operator::NodeRollout;
use std::fmt;
use std::str::FromStr;

/// How many nodes may move to a new revision at the same time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RolloutStrategy {
    #[default]
    Parallel,
    Serial,
}

impl RolloutStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            RolloutStrategy::Parallel => "parallel",
            RolloutStrategy::Serial => "serial",
        }
    }
}

impl fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RolloutStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(RolloutStrategy::Parallel),
            "serial" => Ok(RolloutStrategy::Serial),
            other => Err(format!(
                "unknown rollout policy '{other}' (expected parallel or serial)"
            )),
        }
    }
}

/// Policy hook consulted before a node's target revision is advanced.
pub trait RolloutPolicy: Send + Sync {
    /// Returns whether `node` may begin moving to a new revision given the
    /// rollout state of every node.
    fn may_start(&self, node: &str, rollouts: &[NodeRollout]) -> bool;
}

/// Every node advances independently.
#[derive(Default)]
pub struct ParallelRollout;

impl RolloutPolicy for ParallelRollout {
    fn may_start(&self, _node: &str, _rollouts: &[NodeRollout]) -> bool {
        true
    }
}

/// One node at a time: a node may start only when no other node has a
/// target that differs from its current revision. A node whose retries are
/// exhausted keeps blocking until a newer revision supersedes it.
#[derive(Default)]
pub struct SerialRollout;

impl RolloutPolicy for SerialRollout {
    fn may_start(&self, node: &str, rollouts: &[NodeRollout]) -> bool {
        rollouts
            .iter()
            .filter(|rollout| rollout.node_name != node)
            .all(|rollout| rollout.target_revision == rollout.current_revision)
    }
}

pub fn policy_for(strategy: RolloutStrategy) -> Box<dyn RolloutPolicy> {
    match strategy {
        RolloutStrategy::Parallel => Box::new(ParallelRollout),
        RolloutStrategy::Serial => Box::new(SerialRollout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rollout(node: &str, current: u64, target: u64) -> NodeRollout {
        NodeRollout {
            current_revision: current,
            target_revision: target,
            ..NodeRollout::new(node)
        }
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Serial".parse::<RolloutStrategy>(), Ok(RolloutStrategy::Serial));
        assert_eq!(" parallel ".parse::<RolloutStrategy>(), Ok(RolloutStrategy::Parallel));
        let err = "canary".parse::<RolloutStrategy>().unwrap_err();
        assert!(err.contains("canary"));
    }

    #[test]
    fn serial_waits_for_other_nodes() {
        let policy = SerialRollout;
        let rollouts = vec![rollout("a", 1, 2), rollout("b", 1, 1)];
        assert!(!policy.may_start("b", &rollouts));
        assert!(policy.may_start("a", &rollouts));

        let settled = vec![rollout("a", 2, 2), rollout("b", 1, 1)];
        assert!(policy.may_start("b", &settled));
    }

    #[test]
    fn serial_ignores_nodes_without_a_target() {
        let rollouts = vec![rollout("a", 0, 0), rollout("b", 0, 0)];
        assert!(SerialRollout.may_start("a", &rollouts));
    }

    #[test]
    fn parallel_always_allows() {
        let rollouts = vec![rollout("a", 1, 2), rollout("b", 1, 1)];
        assert!(policy_for(RolloutStrategy::Parallel).may_start("b", &rollouts));
    }
}
