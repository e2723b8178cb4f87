/// Stages systems can subscribe to. Any `u32` below [COUNT](stages::COUNT) is a valid stage;
/// these are the conventional ones.
pub mod stages {
    pub const COUNT: u32 = u32::BITS;

    pub const UPDATE: u32 = 0;
    pub const PRE_RENDER: u32 = 1;
    pub const RENDER: u32 = 2;
    pub const LATE_UPDATE: u32 = 3;
}

/// Passed to systems run by [World::update](crate::World::update).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateStageInfo {
    stage: u32,
    pub dt: f32,
    pub cur_time: f64,
}

impl UpdateStageInfo {
    /// Stages past [stages::COUNT] have an empty mask and run no systems.
    pub fn new(stage: u32, dt: f32, cur_time: f64) -> Self {
        if stage >= stages::COUNT {
            log::error!("update stage {} out of range, at most {} stages", stage, stages::COUNT);
        }
        Self { stage, dt, cur_time }
    }

    #[inline]
    pub fn stage(&self) -> u32 {
        self.stage
    }

    #[inline]
    pub fn mask(&self) -> u32 {
        stage_mask(self.stage)
    }
}

/// Bit of `stage` in a system's stage mask, zero when out of range.
#[inline]
pub(crate) fn stage_mask(stage: u32) -> u32 {
    1u32.checked_shl(stage).unwrap_or(0)
}

/// Order in which systems run: an explicit list first, then the rest by priority and
/// registration.
#[derive(Debug, Default, Clone)]
pub struct Schedule {
    explicit: Vec<String>,
    tags: Option<Vec<String>>,
}

impl Schedule {
    pub fn set_order(&mut self, names: Vec<String>) {
        self.explicit = names;
    }

    pub fn set_tags(&mut self, tags: Option<Vec<String>>) {
        self.tags = tags;
    }

    /// Untagged systems always run, tagged ones only when a tag is enabled.
    pub fn tags_allow(&self, tags: &[String]) -> bool {
        match &self.tags {
            None => true,
            Some(_) if tags.is_empty() => true,
            Some(enabled) => tags.iter().any(|tag| enabled.contains(tag)),
        }
    }

    /// Sorts `(name, priority)` pairs, given in registration order, into run order and returns
    /// their indices.
    pub fn sort<'a>(&self, systems: impl Iterator<Item = (&'a str, i32)>) -> Vec<usize> {
        let systems: Vec<(&str, i32)> = systems.collect();
        let mut order: Vec<usize> = (0..systems.len()).collect();

        let rank = |index: usize| {
            self.explicit
                .iter()
                .position(|name| name == systems[index].0)
                .unwrap_or(usize::MAX)
        };
        // Stable, so equal priorities keep registration order
        order.sort_by_key(|&index| (rank(index), systems[index].1));

        order
    }
}
