//! Directory lookups
//!
//! Students, branches and branch managers are owned by the wider platform.
//! The workflow only reads them through [`Directory`].

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use super::conflicts::{OrderRow, SlotRow, SubscriptionRow};
use super::error::BranchTransferError;
use super::types::{BranchId, SchoolId, StudentId, StudentLevelId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub student_id: StudentId,
    /// Branch the student is enrolled at today
    pub branch_id: BranchId,
    #[serde(default)]
    pub guardian_ids: Vec<UserId>,
}

impl StudentProfile {
    pub fn is_guardian(&self, user_id: UserId) -> bool {
        self.guardian_ids.contains(&user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchProfile {
    pub branch_id: BranchId,
    pub name: String,
    #[serde(default)]
    pub school_ids: Vec<SchoolId>,
    #[serde(default)]
    pub student_level_ids: Vec<StudentLevelId>,
}

impl BranchProfile {
    pub fn supports_school(&self, school_id: SchoolId) -> bool {
        self.school_ids.contains(&school_id)
    }

    pub fn supports_level(&self, level_id: StudentLevelId) -> bool {
        self.student_level_ids.contains(&level_id)
    }
}

/// Read-only view of students, branches and manager scopes
#[async_trait]
pub trait Directory: Send + Sync {
    async fn student(
        &self,
        student_id: StudentId,
    ) -> Result<Option<StudentProfile>, BranchTransferError>;

    async fn branch(&self, branch_id: BranchId)
    -> Result<Option<BranchProfile>, BranchTransferError>;

    /// Branches the user manages (empty for non-managers)
    async fn managed_branches(&self, user_id: UserId) -> Result<Vec<BranchId>, BranchTransferError>;

    async fn manages(&self, user_id: UserId, branch_id: BranchId) -> Result<bool, BranchTransferError> {
        Ok(self.managed_branches(user_id).await?.contains(&branch_id))
    }
}

// ============================================================================
// Fixture-backed directory
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerAssignment {
    pub user_id: UserId,
    pub branch_ids: Vec<BranchId>,
}

/// Dev-mode data set: directory entries plus operational rows for the
/// in-memory store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub branches: Vec<BranchProfile>,
    #[serde(default)]
    pub students: Vec<StudentProfile>,
    #[serde(default)]
    pub managers: Vec<ManagerAssignment>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionRow>,
    #[serde(default)]
    pub slots: Vec<SlotRow>,
    #[serde(default)]
    pub orders: Vec<OrderRow>,
}

impl Fixtures {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixtures {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse fixtures {}", path.display()))
    }
}

/// In-process directory, built from [`Fixtures`] or assembled in tests
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    students: HashMap<StudentId, StudentProfile>,
    branches: HashMap<BranchId, BranchProfile>,
    managers: HashMap<UserId, Vec<BranchId>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixtures(fixtures: &Fixtures) -> Self {
        let mut directory = Self::new();
        for branch in &fixtures.branches {
            directory = directory.with_branch(branch.clone());
        }
        for student in &fixtures.students {
            directory = directory.with_student(student.clone());
        }
        for manager in &fixtures.managers {
            for branch_id in &manager.branch_ids {
                directory = directory.with_manager(manager.user_id, *branch_id);
            }
        }
        directory
    }

    pub fn with_student(mut self, student: StudentProfile) -> Self {
        self.students.insert(student.student_id, student);
        self
    }

    pub fn with_branch(mut self, branch: BranchProfile) -> Self {
        self.branches.insert(branch.branch_id, branch);
        self
    }

    pub fn with_manager(mut self, user_id: UserId, branch_id: BranchId) -> Self {
        let branches = self.managers.entry(user_id).or_default();
        if !branches.contains(&branch_id) {
            branches.push(branch_id);
        }
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn student(
        &self,
        student_id: StudentId,
    ) -> Result<Option<StudentProfile>, BranchTransferError> {
        Ok(self.students.get(&student_id).cloned())
    }

    async fn branch(
        &self,
        branch_id: BranchId,
    ) -> Result<Option<BranchProfile>, BranchTransferError> {
        Ok(self.branches.get(&branch_id).cloned())
    }

    async fn managed_branches(&self, user_id: UserId) -> Result<Vec<BranchId>, BranchTransferError> {
        Ok(self.managers.get(&user_id).cloned().unwrap_or_default())
    }
}

// ============================================================================
// PostgreSQL directory
// ============================================================================

pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn student(
        &self,
        student_id: StudentId,
    ) -> Result<Option<StudentProfile>, BranchTransferError> {
        let row = sqlx::query("SELECT student_id, branch_id FROM students_tb WHERE student_id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let guardian_ids = sqlx::query_scalar::<_, i64>(
            "SELECT user_id FROM student_guardians_tb WHERE student_id = $1 ORDER BY user_id",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(StudentProfile {
            student_id: row.try_get("student_id")?,
            branch_id: row.try_get("branch_id")?,
            guardian_ids,
        }))
    }

    async fn branch(
        &self,
        branch_id: BranchId,
    ) -> Result<Option<BranchProfile>, BranchTransferError> {
        let name = sqlx::query_scalar::<_, String>("SELECT name FROM branches_tb WHERE branch_id = $1")
            .bind(branch_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(name) = name else {
            return Ok(None);
        };

        let school_ids = sqlx::query_scalar::<_, i64>(
            "SELECT school_id FROM branch_schools_tb WHERE branch_id = $1 ORDER BY school_id",
        )
        .bind(branch_id)
        .fetch_all(&self.pool)
        .await?;

        let student_level_ids = sqlx::query_scalar::<_, i64>(
            "SELECT student_level_id FROM branch_student_levels_tb WHERE branch_id = $1 ORDER BY student_level_id",
        )
        .bind(branch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(BranchProfile {
            branch_id,
            name,
            school_ids,
            student_level_ids,
        }))
    }

    async fn managed_branches(&self, user_id: UserId) -> Result<Vec<BranchId>, BranchTransferError> {
        let branches = sqlx::query_scalar::<_, i64>(
            "SELECT branch_id FROM branch_managers_tb WHERE user_id = $1 ORDER BY branch_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(branches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"
branches:
  - branch_id: 1
    name: Downtown
    school_ids: [100]
  - branch_id: 2
    name: Riverside
    school_ids: [200, 201]
    student_level_ids: [3]
students:
  - student_id: 42
    branch_id: 1
    guardian_ids: [7]
managers:
  - user_id: 100
    branch_ids: [1, 2]
subscriptions:
  - subscription_id: 1
    student_id: 42
    branch_id: 1
    package_name: Monthly
    price_final: "1000000"
    used_slots: 5
    total_slots: 10
    status: active
"#;

    #[tokio::test]
    async fn test_directory_from_fixture_yaml() {
        let fixtures: Fixtures = serde_yaml::from_str(FIXTURE).unwrap();
        assert_eq!(fixtures.subscriptions.len(), 1);

        let dir = StaticDirectory::from_fixtures(&fixtures);
        let student = dir.student(42).await.unwrap().unwrap();
        assert_eq!(student.branch_id, 1);
        assert!(student.is_guardian(7));
        assert!(!student.is_guardian(8));

        let branch = dir.branch(2).await.unwrap().unwrap();
        assert!(branch.supports_school(201));
        assert!(branch.supports_level(3));
        assert!(!branch.supports_school(100));

        assert!(dir.manages(100, 2).await.unwrap());
        assert!(!dir.manages(101, 2).await.unwrap());
        assert!(dir.student(43).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_manager_is_idempotent() {
        let dir = StaticDirectory::new()
            .with_manager(5, 1)
            .with_manager(5, 1)
            .with_manager(5, 3);
        assert_eq!(dir.managed_branches(5).await.unwrap(), vec![1, 3]);
        assert!(dir.managed_branches(6).await.unwrap().is_empty());
    }
}
