use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::Task;

/// Bounded-autonomy tiers, ordered from fully autonomous to human-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    L0Autonomous,
    L1Notify,
    L2Approve,
    L3HumanOnly,
}

impl AutonomyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AutonomyLevel::L0Autonomous => "l0_autonomous",
            AutonomyLevel::L1Notify => "l1_notify",
            AutonomyLevel::L2Approve => "l2_approve",
            AutonomyLevel::L3HumanOnly => "l3_human_only",
        }
    }
}

/// Closed set of operation classes recognized by the autonomy gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    ReadFile,
    RunTests,
    WriteFile,
    Refactor,
    InstallDependency,
    CommitChanges,
    DeployStaging,
    DeleteData,
    DeployProduction,
    ModifySecurity,
    RotateSecrets,
    General,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationClass::ReadFile => "read_file",
            OperationClass::RunTests => "run_tests",
            OperationClass::WriteFile => "write_file",
            OperationClass::Refactor => "refactor",
            OperationClass::InstallDependency => "install_dependency",
            OperationClass::CommitChanges => "commit_changes",
            OperationClass::DeployStaging => "deploy_staging",
            OperationClass::DeleteData => "delete_data",
            OperationClass::DeployProduction => "deploy_production",
            OperationClass::ModifySecurity => "modify_security",
            OperationClass::RotateSecrets => "rotate_secrets",
            OperationClass::General => "general",
        }
    }

    /// Static risk tier for each operation class.
    pub fn autonomy_level(self) -> AutonomyLevel {
        match self {
            OperationClass::ReadFile | OperationClass::RunTests | OperationClass::General => {
                AutonomyLevel::L0Autonomous
            }
            OperationClass::WriteFile
            | OperationClass::Refactor
            | OperationClass::InstallDependency => AutonomyLevel::L1Notify,
            OperationClass::CommitChanges
            | OperationClass::DeployStaging
            | OperationClass::DeployProduction => AutonomyLevel::L2Approve,
            OperationClass::DeleteData
            | OperationClass::ModifySecurity
            | OperationClass::RotateSecrets => AutonomyLevel::L3HumanOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalDecision {
    pub fn is_settled(self) -> bool {
        !matches!(self, ApprovalDecision::Pending)
    }
}

/// Approval lifecycle record created by the gate at L2/L3. The gate owns the
/// record; the supervisor holds only the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub task_id: String,
    pub operation_class: OperationClass,
    pub autonomy_level: AutonomyLevel,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub decision: ApprovalDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decider: Option<String>,
}

impl ApprovalRequest {
    pub fn for_task(task: &Task, class: OperationClass, level: AutonomyLevel) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            operation_class: class,
            autonomy_level: level,
            description: task.description.clone(),
            created_at: Utc::now(),
            decision: ApprovalDecision::Pending,
            decided_at: None,
            decider: None,
        }
    }

    pub fn settle(&mut self, decision: ApprovalDecision, decider: Option<String>) {
        self.decision = decision;
        self.decided_at = Some(Utc::now());
        self.decider = decider;
    }
}
