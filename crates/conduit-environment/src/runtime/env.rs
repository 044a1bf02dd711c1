// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner environment injection.

use conduit_core::ServiceAccount;
use conduit_core::instance::WorkflowInstance;
use conduit_core::resource::Resource;
use conduit_core::runner::{RunnerConfig, RuntimePlatform};

use super::RuntimeSettings;

/// Build the runner contract for one instance.
pub fn runner_config(
    settings: &RuntimeSettings,
    platform: RuntimePlatform,
    instance: &WorkflowInstance,
    service_account: &ServiceAccount,
) -> RunnerConfig {
    RunnerConfig {
        api_uri: settings.api_uri.clone(),
        service_account_name: service_account.id(),
        service_account_key: service_account.key.clone(),
        secrets_directory: settings.secrets_directory.clone(),
        workflow_instance: instance.id(),
        platform,
        skip_certificate_validation: settings.skip_certificate_validation,
    }
}

/// Environment variables injected into a runner unit.
///
/// Secret values are never part of this list; they are mounted.
pub fn runner_env(
    settings: &RuntimeSettings,
    platform: RuntimePlatform,
    instance: &WorkflowInstance,
    service_account: &ServiceAccount,
) -> Vec<(String, String)> {
    runner_config(settings, platform, instance, service_account).to_env()
}
