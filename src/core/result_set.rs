use std::collections::HashMap;

use serde::Serialize;

use crate::core::domain::{BuildConfig, CaseId, ConfigId, ConfigMatrix, ExecutionOutcome, TestCase};

/// Outcome of one (case, config) unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConfigRecord {
    pub outcome: ExecutionOutcome,
    /// Repeated executions of the same artifact disagreed.
    pub unstable: bool,
}

impl ConfigRecord {
    pub fn new(outcome: ExecutionOutcome) -> Self {
        ConfigRecord {
            outcome,
            unstable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("result set for {case_id} has {actual} of {expected} outcomes")]
pub struct IncompleteResultSet {
    pub case_id: CaseId,
    pub expected: usize,
    pub actual: usize,
}

/// Every configuration of the matrix paired with its outcome, in matrix
/// declaration order. Can only be built complete.
#[derive(Clone, Debug)]
pub struct CaseResultSet {
    case_id: CaseId,
    entries: Vec<(BuildConfig, ConfigRecord)>,
}

impl CaseResultSet {
    pub fn assemble<I>(
        case_id: CaseId,
        matrix: &ConfigMatrix,
        records: I,
    ) -> Result<Self, IncompleteResultSet>
    where
        I: IntoIterator<Item = (ConfigId, ConfigRecord)>,
    {
        let mut records: HashMap<ConfigId, ConfigRecord> = records
            .into_iter()
            .filter(|(id, _)| matrix.get(id).is_some())
            .collect();

        let entries: Vec<_> = matrix
            .configs()
            .iter()
            .filter_map(|config| {
                records
                    .remove(&config.name)
                    .map(|record| (config.clone(), record))
            })
            .collect();

        if entries.len() != matrix.len() {
            return Err(IncompleteResultSet {
                case_id,
                expected: matrix.len(),
                actual: entries.len(),
            });
        }

        Ok(CaseResultSet { case_id, entries })
    }

    pub fn case_id(&self) -> &CaseId {
        &self.case_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&BuildConfig, &ConfigRecord)> {
        self.entries.iter().map(|(config, record)| (config, record))
    }
}

/// Accumulates unit outcomes for one case while workers are still running.
#[derive(Debug)]
pub struct PendingCase {
    pub case: TestCase,
    expected: usize,
    records: HashMap<ConfigId, ConfigRecord>,
}

impl PendingCase {
    pub fn new(case: TestCase, matrix: &ConfigMatrix) -> Self {
        PendingCase {
            case,
            expected: matrix.len(),
            records: HashMap::with_capacity(matrix.len()),
        }
    }

    /// Returns false if the configuration already had an outcome.
    pub fn record(&mut self, config: ConfigId, record: ConfigRecord) -> bool {
        self.records.insert(config, record).is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.records.len() == self.expected
    }

    pub fn finish(self, matrix: &ConfigMatrix) -> Result<(TestCase, CaseResultSet), IncompleteResultSet> {
        let results = CaseResultSet::assemble(self.case.id.clone(), matrix, self.records)?;
        Ok((self.case, results))
    }
}
