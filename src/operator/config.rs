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

use crate::operator::controller::rollout::RolloutStrategy;
use crate::operator::controller::status;
use crate::operator::k8s::operator::DEFAULT_TARGET_NAMESPACE;
use crate::operator::logger::LogFormat;
use std::env;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Environment variables understood by the operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Config {
    Image,
    OperatorVersion,
    TargetNamespace,
    Workers,
    MaxInstallerRetries,
    InstallerBackoffBase,
    InstallerBackoffMax,
    InstallerPollInterval,
    RevisionRetention,
    RevisionMinAge,
    PruneInterval,
    Quorum,
    RolloutPolicy,
    ResyncInterval,
    LogFormat,
}

impl Config {
    pub const ALL: [Config; 15] = [
        Config::Image,
        Config::OperatorVersion,
        Config::TargetNamespace,
        Config::Workers,
        Config::MaxInstallerRetries,
        Config::InstallerBackoffBase,
        Config::InstallerBackoffMax,
        Config::InstallerPollInterval,
        Config::RevisionRetention,
        Config::RevisionMinAge,
        Config::PruneInterval,
        Config::Quorum,
        Config::RolloutPolicy,
        Config::ResyncInterval,
        Config::LogFormat,
    ];

    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Image => "IMAGE",
            Config::OperatorVersion => "OPERATOR_IMAGE_VERSION",
            Config::TargetNamespace => "TARGET_NAMESPACE",
            Config::Workers => "WORKERS",
            Config::MaxInstallerRetries => "MAX_INSTALLER_RETRIES",
            Config::InstallerBackoffBase => "INSTALLER_BACKOFF_BASE",
            Config::InstallerBackoffMax => "INSTALLER_BACKOFF_MAX",
            Config::InstallerPollInterval => "INSTALLER_POLL_INTERVAL",
            Config::RevisionRetention => "REVISION_RETENTION",
            Config::RevisionMinAge => "REVISION_MIN_AGE",
            Config::PruneInterval => "PRUNE_INTERVAL",
            Config::Quorum => "QUORUM",
            Config::RolloutPolicy => "ROLLOUT_POLICY",
            Config::ResyncInterval => "RESYNC_INTERVAL",
            Config::LogFormat => "LOG_FORMAT",
        }
    }

    /// Returns the value used when the variable is unset. An empty default
    /// means "not configured".
    pub fn default_value(&self) -> &'static str {
        match self {
            Config::Image => "",
            Config::OperatorVersion => "0.0.1-snapshot",
            Config::TargetNamespace => DEFAULT_TARGET_NAMESPACE,
            Config::Workers => "1",
            Config::MaxInstallerRetries => "5",
            Config::InstallerBackoffBase => "10s",
            Config::InstallerBackoffMax => "5m",
            Config::InstallerPollInterval => "5s",
            Config::RevisionRetention => "5",
            Config::RevisionMinAge => "0s",
            Config::PruneInterval => "1m",
            Config::Quorum => "",
            Config::RolloutPolicy => "parallel",
            Config::ResyncInterval => "10m",
            Config::LogFormat => "text",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get(&self) -> String {
        env::var(self.env_var()).unwrap_or_else(|_| self.default_value().to_string())
    }
}

#[derive(Debug)]
pub struct ConfigError {
    variable: &'static str,
    value: String,
    reason: String,
}

impl ConfigError {
    fn new(config: Config, value: &str, reason: impl Into<String>) -> Self {
        Self {
            variable: config.env_var(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn variable(&self) -> &'static str {
        self.variable
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid value '{}' for {}: {}",
            self.value, self.variable, self.reason
        )
    }
}

impl Error for ConfigError {}

/// Fully resolved runtime settings.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorSettings {
    pub image: Option<String>,
    pub operator_version: String,
    pub target_namespace: String,
    pub workers: usize,
    pub max_installer_retries: u32,
    pub installer_backoff_base: Duration,
    pub installer_backoff_max: Duration,
    pub installer_poll_interval: Duration,
    pub revision_retention: usize,
    pub revision_min_age: Duration,
    pub prune_interval: Duration,
    /// Explicit quorum count; `None` means a majority of known nodes.
    pub quorum: Option<usize>,
    pub rollout_strategy: RolloutStrategy,
    pub resync_interval: Duration,
    pub log_format: LogFormat,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        // Defaults are always parseable.
        Self::from_lookup(|_| None).unwrap_or_else(|err| unreachable!("{err}"))
    }
}

impl OperatorSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolves settings through `lookup`, falling back to defaults for
    /// missing or empty values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = |config: Config| -> String {
            lookup(config.env_var())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| config.default_value().to_string())
        };

        let image = Some(raw(Config::Image)).filter(|value| !value.is_empty());
        let quorum = match raw(Config::Quorum).as_str() {
            "" | "majority" => None,
            value => Some(parse_count(Config::Quorum, value, 1)?),
        };
        let rollout_strategy = raw(Config::RolloutPolicy)
            .parse::<RolloutStrategy>()
            .map_err(|reason| {
                ConfigError::new(Config::RolloutPolicy, &raw(Config::RolloutPolicy), reason)
            })?;
        let log_format = raw(Config::LogFormat)
            .parse::<LogFormat>()
            .map_err(|reason| ConfigError::new(Config::LogFormat, &raw(Config::LogFormat), reason))?;

        let settings = OperatorSettings {
            image,
            operator_version: raw(Config::OperatorVersion),
            target_namespace: raw(Config::TargetNamespace),
            workers: parse_count(Config::Workers, &raw(Config::Workers), 1)?,
            max_installer_retries: parse_count(
                Config::MaxInstallerRetries,
                &raw(Config::MaxInstallerRetries),
                1,
            )? as u32,
            installer_backoff_base: parse_duration(
                Config::InstallerBackoffBase,
                &raw(Config::InstallerBackoffBase),
            )?,
            installer_backoff_max: parse_duration(
                Config::InstallerBackoffMax,
                &raw(Config::InstallerBackoffMax),
            )?,
            installer_poll_interval: parse_duration(
                Config::InstallerPollInterval,
                &raw(Config::InstallerPollInterval),
            )?,
            revision_retention: parse_count(
                Config::RevisionRetention,
                &raw(Config::RevisionRetention),
                0,
            )?,
            revision_min_age: parse_duration(Config::RevisionMinAge, &raw(Config::RevisionMinAge))?,
            prune_interval: parse_duration(Config::PruneInterval, &raw(Config::PruneInterval))?,
            quorum,
            rollout_strategy,
            resync_interval: parse_duration(Config::ResyncInterval, &raw(Config::ResyncInterval))?,
            log_format,
        };

        if settings.installer_backoff_max < settings.installer_backoff_base {
            return Err(ConfigError::new(
                Config::InstallerBackoffMax,
                &raw(Config::InstallerBackoffMax),
                "must not be shorter than INSTALLER_BACKOFF_BASE",
            ));
        }
        if settings.prune_interval.is_zero() {
            return Err(ConfigError::new(
                Config::PruneInterval,
                &raw(Config::PruneInterval),
                "must be greater than zero",
            ));
        }
        Ok(settings)
    }

    /// Quorum required for availability among `nodes` known nodes.
    pub fn quorum_for(&self, nodes: usize) -> usize {
        status::quorum_for(nodes, self.quorum)
    }
}

fn parse_count(config: Config, value: &str, minimum: usize) -> Result<usize, ConfigError> {
    let parsed = value
        .parse::<usize>()
        .map_err(|err| ConfigError::new(config, value, err.to_string()))?;
    if parsed < minimum {
        return Err(ConfigError::new(
            config,
            value,
            format!("must be at least {minimum}"),
        ));
    }
    Ok(parsed)
}

fn parse_duration(config: Config, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|err| ConfigError::new(config, value, err.to_string()))
}
