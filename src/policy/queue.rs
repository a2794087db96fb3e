//! Receding-horizon action queue.
//!
//! The controller buffers the last `n_obs_steps` observations and a cache of
//! up to `n_action_steps` actions. The model runs only when the cache is
//! empty; each run predicts `horizon` steps starting at the oldest buffered
//! observation, of which steps `[n_obs_steps - 1, n_obs_steps - 1 + n_action_steps)`
//! are cached. Index `n_obs_steps - 1` is the current step.

use std::collections::VecDeque;

use ndarray::{s, stack, Array2, Array3, Array4, Array5, ArrayView2, ArrayView4, Axis};
use tracing::debug;

use crate::config::{validate_action_steps, ACTION};
use crate::error::{PolicyError, Result};

/// FIFO with a fixed capacity; pushing into a full queue drops the oldest item.
#[derive(Clone, Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Replicate `item` until the queue is full if it is not, otherwise push once.
    pub fn populate(&mut self, item: T) {
        if self.is_full() {
            self.push(item);
        } else {
            while !self.is_full() {
                self.items.push_back(item.clone());
            }
        }
    }
}

/// Produces a full, unnormalised trajectory `[batch, horizon, action_dim]`
/// from a stacked observation window.
pub trait TrajectoryGenerator {
    /// `state: [batch, n_obs_steps, state_dim]`, `image: [batch, n_obs_steps, C, H, W]`
    fn generate_trajectory(&mut self, state: &Array3<f32>, image: &Array5<f32>) -> Result<Array3<f32>>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub model_invocations: u64,
    pub actions_served: u64,
}

#[derive(Clone, Debug)]
pub struct ActionQueueController {
    n_obs_steps: usize,
    horizon: usize,
    n_action_steps: usize,
    states: BoundedQueue<Array2<f32>>,
    images: BoundedQueue<Array4<f32>>,
    actions: BoundedQueue<Array2<f32>>,
    stats: ControllerStats,
}

impl ActionQueueController {
    pub fn new(n_obs_steps: usize, horizon: usize, n_action_steps: usize) -> Result<Self> {
        validate_action_steps(n_obs_steps, horizon, n_action_steps)?;
        Ok(Self {
            n_obs_steps,
            horizon,
            n_action_steps,
            states: BoundedQueue::new(n_obs_steps),
            images: BoundedQueue::new(n_obs_steps),
            actions: BoundedQueue::new(n_action_steps),
            stats: ControllerStats::default(),
        })
    }

    /// Empty every buffer. Counters are kept.
    pub fn reset(&mut self) {
        self.states.clear();
        self.images.clear();
        self.actions.clear();
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    pub fn cached_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn buffered_observations(&self) -> usize {
        self.states.len()
    }

    /// Buffer one normalised observation and return the action for this step.
    ///
    /// `state: [batch, state_dim]`, `image: [batch, C, H, W]`; returns `[batch, action_dim]`.
    pub fn select_action<G>(&mut self, state: Array2<f32>, image: Array4<f32>, generator: &mut G) -> Result<Array2<f32>>
    where
        G: TrajectoryGenerator + ?Sized,
    {
        if state.nrows() != image.shape()[0] {
            let mut expected = image.shape().to_vec();
            expected[0] = state.nrows();
            return Err(PolicyError::shape("observation.image", &expected, image.shape()));
        }
        self.states.populate(state);
        self.images.populate(image);

        if self.actions.is_empty() {
            self.refill(generator)?;
        }

        let action = self
            .actions
            .pop()
            .ok_or_else(|| PolicyError::MissingField(ACTION.to_string()))?;
        self.stats.actions_served += 1;
        Ok(action)
    }

    fn refill<G>(&mut self, generator: &mut G) -> Result<()>
    where
        G: TrajectoryGenerator + ?Sized,
    {
        let states: Vec<ArrayView2<f32>> = self.states.iter().map(|s| s.view()).collect();
        let images: Vec<ArrayView4<f32>> = self.images.iter().map(|i| i.view()).collect();
        let state = stack(Axis(1), &states)?;
        let image = stack(Axis(1), &images)?;

        let trajectory = generator.generate_trajectory(&state, &image)?;
        self.stats.model_invocations += 1;

        let (batch, horizon, action_dim) = trajectory.dim();
        if batch != state.shape()[0] || horizon != self.horizon {
            return Err(PolicyError::shape(
                ACTION,
                &[state.shape()[0], self.horizon, action_dim],
                trajectory.shape(),
            ));
        }

        let start = self.n_obs_steps - 1;
        let end = start + self.n_action_steps;
        for step in trajectory.slice(s![.., start..end, ..]).axis_iter(Axis(1)) {
            self.actions.push(step.to_owned());
        }
        debug!(
            invocation = self.stats.model_invocations,
            cached = self.actions.len(),
            start,
            "generated action chunk"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits trajectories whose entries encode `(invocation, step)`.
    struct CountingGenerator {
        horizon: usize,
        calls: usize,
        last_window: Option<Array3<f32>>,
    }

    impl CountingGenerator {
        fn new(horizon: usize) -> Self {
            Self {
                horizon,
                calls: 0,
                last_window: None,
            }
        }
    }

    impl TrajectoryGenerator for CountingGenerator {
        fn generate_trajectory(&mut self, state: &Array3<f32>, _image: &Array5<f32>) -> Result<Array3<f32>> {
            self.calls += 1;
            self.last_window = Some(state.clone());
            let call = self.calls as f32;
            Ok(Array3::from_shape_fn((state.shape()[0], self.horizon, 2), |(_, t, d)| {
                call * 100.0 + t as f32 + d as f32 * 0.5
            }))
        }
    }

    fn observation(value: f32) -> (Array2<f32>, Array4<f32>) {
        (Array2::from_elem((1, 2), value), Array4::zeros((1, 3, 4, 4)))
    }

    #[test]
    fn test_bounded_queue_drops_oldest() {
        let mut queue = BoundedQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_populate_replicates_first_item() {
        let mut queue = BoundedQueue::new(3);
        queue.populate(7);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![7, 7, 7]);
        queue.populate(8);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![7, 7, 8]);
    }

    #[test]
    fn test_receding_horizon_schedule() {
        let mut controller = ActionQueueController::new(2, 8, 3).unwrap();
        let mut generator = CountingGenerator::new(8);

        let (s, i) = observation(0.0);
        let first = controller.select_action(s, i, &mut generator).unwrap();
        assert_eq!(generator.calls, 1);
        assert_eq!(controller.cached_actions(), 2);
        // Trajectory index 1 is the current step for two observation steps.
        assert_eq!(first[[0, 0]], 101.0);
        assert_eq!(first[[0, 1]], 101.5);

        for (k, expected) in [(1.0, 102.0), (2.0, 103.0)] {
            let (s, i) = observation(k);
            let action = controller.select_action(s, i, &mut generator).unwrap();
            assert_eq!(generator.calls, 1);
            assert_eq!(action[[0, 0]], expected);
        }
        assert_eq!(controller.cached_actions(), 0);

        let (s, i) = observation(3.0);
        let fourth = controller.select_action(s, i, &mut generator).unwrap();
        assert_eq!(generator.calls, 2);
        assert_eq!(fourth[[0, 0]], 201.0);
        assert_eq!(
            controller.stats(),
            ControllerStats {
                model_invocations: 2,
                actions_served: 4
            }
        );

        // The second invocation saw the two most recent observations.
        let window = generator.last_window.unwrap();
        assert_eq!(window[[0, 0, 0]], 2.0);
        assert_eq!(window[[0, 1, 0]], 3.0);
    }

    #[test]
    fn test_first_observation_is_replicated() {
        let mut controller = ActionQueueController::new(3, 8, 2).unwrap();
        let mut generator = CountingGenerator::new(8);
        let (s, i) = observation(5.0);
        controller.select_action(s, i, &mut generator).unwrap();
        let window = generator.last_window.unwrap();
        assert_eq!(window.dim(), (1, 3, 2));
        assert!(window.iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_reset_forces_new_invocation() {
        let mut controller = ActionQueueController::new(2, 8, 3).unwrap();
        let mut generator = CountingGenerator::new(8);
        let (s, i) = observation(0.0);
        controller.select_action(s, i, &mut generator).unwrap();
        controller.reset();
        assert_eq!(controller.cached_actions(), 0);
        assert_eq!(controller.buffered_observations(), 0);

        let (s, i) = observation(1.0);
        controller.select_action(s, i, &mut generator).unwrap();
        assert_eq!(generator.calls, 2);
        assert!(generator.last_window.unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_invalid_construction() {
        assert!(matches!(
            ActionQueueController::new(2, 8, 7),
            Err(PolicyError::InvalidActionSteps { .. })
        ));
        assert!(ActionQueueController::new(0, 8, 1).is_err());
    }

    #[test]
    fn test_wrong_horizon_from_generator() {
        let mut controller = ActionQueueController::new(2, 8, 3).unwrap();
        let mut generator = CountingGenerator::new(5);
        let (s, i) = observation(0.0);
        assert!(matches!(
            controller.select_action(s, i, &mut generator),
            Err(PolicyError::ShapeMismatch { .. })
        ));
    }
}
