//! Capability-group permission gate.

use std::collections::BTreeSet;

use crate::io::config::PermissionConfig;

use super::PermissionGroup;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permissions {
    pub can_execute: bool,
    pub can_read: bool,
    pub disabled_groups: BTreeSet<PermissionGroup>,
}

impl Default for Permissions {
    fn default() -> Self {
        Self::from_config(&PermissionConfig::default())
    }
}

impl Permissions {
    pub fn from_config(config: &PermissionConfig) -> Self {
        Self {
            can_execute: config.can_execute,
            can_read: config.can_read,
            disabled_groups: config.disabled_groups.clone(),
        }
    }

    /// `Err` carries the denial message reported as the task result.
    pub fn check(&self, group: Option<PermissionGroup>) -> Result<(), String> {
        let Some(group) = group else {
            return Ok(());
        };
        let flag_allows = match group {
            PermissionGroup::ShellExecution | PermissionGroup::FilesystemWrite => self.can_execute,
            PermissionGroup::FilesystemRead | PermissionGroup::InternetAccess => self.can_read,
        };
        if !flag_allows {
            let flag = match group {
                PermissionGroup::ShellExecution | PermissionGroup::FilesystemWrite => {
                    "can_execute"
                }
                PermissionGroup::FilesystemRead | PermissionGroup::InternetAccess => "can_read",
            };
            return Err(format!(
                "Permission denied: `{group}` tools require `{flag}`, which is disabled"
            ));
        }
        if self.disabled_groups.contains(&group) {
            return Err(format!(
                "Permission denied: `{group}` is disabled in configuration"
            ));
        }
        Ok(())
    }

    pub fn allows(&self, group: Option<PermissionGroup>) -> bool {
        self.check(group).is_ok()
    }
}
