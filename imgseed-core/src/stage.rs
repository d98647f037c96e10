//! The ordered table of build stages.

use std::fmt;

use crate::target::BuildTarget;

/// What a stage does. Returning `Ok` means the stage is complete.
pub type StageAction = Box<dyn Fn(&BuildTarget) -> anyhow::Result<()>>;

pub struct Stage {
    /// 1-based position in the registry.
    pub level: u32,
    pub name: &'static str,
    pub description: &'static str,
    action: StageAction,
}

impl Stage {
    pub fn run(&self, target: &BuildTarget) -> anyhow::Result<()> {
        (self.action)(target)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("level", &self.level)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Stages in the order they run. Levels are assigned by position when a stage
/// is added and never change afterwards.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: Vec<Stage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage at the next level.
    pub fn stage<F>(mut self, name: &'static str, description: &'static str, action: F) -> Self
    where
        F: Fn(&BuildTarget) -> anyhow::Result<()> + 'static,
    {
        let level = self.stages.len() as u32 + 1;
        self.stages.push(Stage {
            level,
            name,
            description,
            action: Box::new(action),
        });
        self
    }

    /// Level of the last stage; 0 for an empty registry.
    pub fn final_level(&self) -> u32 {
        self.stages.len() as u32
    }

    pub fn get(&self, level: u32) -> Option<&Stage> {
        level
            .checked_sub(1)
            .and_then(|i| self.stages.get(i as usize))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    /// The stages needed to go from `completed` to `finish`, i.e. levels
    /// `completed + 1 ..= finish`. Empty when there is nothing to do.
    pub fn pending(&self, completed: u32, finish: u32) -> &[Stage] {
        let finish = finish.min(self.final_level()) as usize;
        let start = (completed as usize).min(finish);
        &self.stages[start..finish]
    }
}
