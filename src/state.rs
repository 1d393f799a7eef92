/// Lifecycle phase of a single multipart ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Active,
    Errored,
    Completed,
}

/// Bookkeeping of the three independent event sources of an ingestion: field
/// values, staging writes and the end of the multipart stream.
///
/// The ingestion is complete once the stream is finished, every announced
/// file has been staged and every announced field has been recorded. Events
/// may arrive in any order, [IngestState::complete] reports the transition to
/// [Phase::Completed] exactly once.
#[derive(Debug, Clone, Default)]
pub struct IngestState {
    phase: Phase,
    fields_expected: usize,
    fields_recorded: usize,
    files_announced: usize,
    files_staged: usize,
    finished: bool,
}

impl IngestState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of staging writes still in flight.
    pub fn pending_files(&self) -> usize {
        self.files_announced - self.files_staged
    }

    pub fn field_announced(&mut self) {
        if self.phase == Phase::Active {
            self.fields_expected += 1;
        }
    }

    pub fn field_recorded(&mut self) {
        if self.phase == Phase::Active {
            self.fields_recorded += 1;
        }
    }

    pub fn file_announced(&mut self) {
        if self.phase == Phase::Active {
            self.files_announced += 1;
        }
    }

    pub fn file_staged(&mut self) {
        if self.phase == Phase::Active {
            debug_assert!(self.files_staged < self.files_announced);
            self.files_staged += 1;
        }
    }

    pub fn finish(&mut self) {
        if self.phase == Phase::Active {
            self.finished = true;
        }
    }

    fn is_settled(&self) -> bool {
        self.finished
            && self.files_announced == self.files_staged
            && self.fields_expected == self.fields_recorded
    }

    /// Moves to [Phase::Completed] when every event source is settled.
    ///
    /// Returns `true` only on the call performing the transition.
    pub fn complete(&mut self) -> bool {
        if self.phase == Phase::Active && self.is_settled() {
            self.phase = Phase::Completed;
            return true;
        }
        false
    }

    /// Moves to [Phase::Errored].
    ///
    /// Returns `true` only on the call performing the transition, a completed
    /// ingestion can not fail anymore.
    pub fn fail(&mut self) -> bool {
        if self.phase == Phase::Active {
            self.phase = Phase::Errored;
            return true;
        }
        false
    }
}
