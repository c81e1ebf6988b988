//! Batch accounting.

use crate::records::BatchState;
use crate::util::Result;

use super::RenderParams;

/// How a render's samples split into dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchPlan {
    pub total_batches: u32,
    pub batch_size: u32,
    pub max_depth: u32,
}

impl BatchPlan {
    pub fn new(params: &RenderParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            total_batches: params.total_batches(),
            batch_size: params.batch_size,
            max_depth: params.max_depth,
        })
    }

    /// Record uploaded before dispatching batch `index`.
    pub fn state(&self, index: u32) -> BatchState {
        BatchState {
            batch_index: index,
            samples_this_batch: self.batch_size,
            total_batches: self.total_batches,
            max_depth: self.max_depth,
        }
    }

    /// Progress once batch `index` has completed.
    pub fn progress_after(&self, index: u32) -> f32 {
        (index + 1) as f32 / self.total_batches as f32
    }

    pub fn batches(&self) -> impl Iterator<Item = BatchState> + '_ {
        (0..self.total_batches).map(|i| self.state(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_256_in_batches_of_64() {
        let params = RenderParams {
            samples: 256,
            batch_size: 64,
            ..Default::default()
        };
        let plan = BatchPlan::new(&params).unwrap();
        assert_eq!(plan.total_batches, 4);
        let progress: Vec<f32> = (0..4).map(|i| plan.progress_after(i)).collect();
        assert_eq!(progress, vec![0.25, 0.5, 0.75, 1.0]);

        let states: Vec<BatchState> = plan.batches().collect();
        assert_eq!(states.len(), 4);
        assert_eq!(states[3].samples_before(), 192);
        assert!(states.iter().all(|s| s.samples_this_batch == 64 && s.total_batches == 4));
    }

    #[test]
    fn test_single_batch() {
        let params = RenderParams {
            samples: 16,
            batch_size: 16,
            max_depth: 2,
            ..Default::default()
        };
        let plan = BatchPlan::new(&params).unwrap();
        assert_eq!(plan.total_batches, 1);
        assert_eq!(plan.progress_after(0), 1.0);
        assert_eq!(plan.state(0).max_depth, 2);
    }
}
