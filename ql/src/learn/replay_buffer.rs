use std::collections::VecDeque;
use std::rc::Rc;

use crate::prelude::Action;

/// Bounded FIFO; adding to a full buffer evicts the oldest element
pub struct RingBuffer<T> {
    max_buffer_len: usize,
    pub(crate) buffer: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(max_buffer_len: usize) -> Self {
        assert!(max_buffer_len > 0);
        Self {
            max_buffer_len,
            buffer: VecDeque::with_capacity(max_buffer_len.min(1 << 16)),
        }
    }

    pub fn len(&self) -> usize { self.buffer.len() }

    pub fn is_empty(&self) -> bool { self.buffer.is_empty() }

    pub fn add(
        &mut self,
        element: T,
    ) {
        if self.buffer.len() == self.max_buffer_len {
            self.buffer.pop_front();
        }
        self.buffer.push_back(element);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> { self.buffer.iter() }

    /// returns references to the values at the specified `indices`
    pub fn get_many<const N: usize>(
        &self,
        indices: &[usize; N],
    ) -> [&T; N] {
        debug_assert!(!indices.iter().any(|&e| e >= self.buffer.len()));
        indices.map(|i| &self.buffer[i])
    }
}

impl<T: Copy> RingBuffer<T> {
    /// returns copies of the values at the specified `indices`
    pub fn get_many_as_val<const N: usize>(
        &self,
        indices: &[usize; N],
    ) -> [T; N] {
        debug_assert!(!indices.iter().any(|&e| e >= self.buffer.len()));
        indices.map(|i| self.buffer[i])
    }
}

pub struct ReplaySamples<'a, S, A, const N: usize> {
    pub action: [A; N],
    pub state: [&'a Rc<S>; N],
    pub state_next: [&'a Rc<S>; N],
    pub reward: [f32; N],
    pub done: [bool; N],
}

/// Experience replay memory plus the history of recent episode rewards
pub struct ReplayBuffer<S, A>
where
    A: Action,
{
    action_history: RingBuffer<A>,
    state_history: RingBuffer<Rc<S>>,
    state_next_history: RingBuffer<Rc<S>>,
    reward_history: RingBuffer<f32>,
    done_history: RingBuffer<bool>,
    episode_reward_history: RingBuffer<f32>,
}

impl<S, A> ReplayBuffer<S, A>
where
    A: Action,
{
    pub fn new(
        step_buffer_len: usize,
        episode_reward_buffer_len: usize,
    ) -> Self {
        Self {
            action_history: RingBuffer::new(step_buffer_len),
            state_history: RingBuffer::new(step_buffer_len),
            state_next_history: RingBuffer::new(step_buffer_len),
            reward_history: RingBuffer::new(step_buffer_len),
            done_history: RingBuffer::new(step_buffer_len),
            episode_reward_history: RingBuffer::new(episode_reward_buffer_len),
        }
    }

    /// Number of stored transitions
    pub fn len(&self) -> usize { self.done_history.len() }

    pub fn is_empty(&self) -> bool { self.done_history.is_empty() }

    pub fn add(
        &mut self,
        action: A,
        state: Rc<S>,
        state_next: Rc<S>,
        reward: f32,
        done: bool,
    ) {
        self.action_history.add(action);
        self.state_history.add(state);
        self.state_next_history.add(state_next);
        self.reward_history.add(reward);
        self.done_history.add(done);
    }

    pub fn get_many<const N: usize>(
        &self,
        indices: &[usize; N],
    ) -> ReplaySamples<S, A, N> {
        ReplaySamples {
            action: self.action_history.get_many_as_val(indices),
            state: self.state_history.get_many(indices),
            state_next: self.state_next_history.get_many(indices),
            reward: self.reward_history.get_many_as_val(indices),
            done: self.done_history.get_many_as_val(indices),
        }
    }

    pub fn actions(&self) -> &RingBuffer<A> { &self.action_history }

    pub fn add_episode_reward(
        &mut self,
        episode_reward: f32,
    ) {
        self.episode_reward_history.add(episode_reward)
    }

    pub fn episode_rewards(&self) -> Vec<f32> { self.episode_reward_history.iter().copied().collect() }

    /// Mean over the recent episode rewards; 0.0 before the first episode
    pub fn avg_episode_reward(&self) -> f32 {
        let c = &self.episode_reward_history.buffer;
        if c.is_empty() {
            return 0.0;
        }
        c.iter().sum::<f32>() / c.len() as f32
    }

    pub fn min_episode_reward(&self) -> f32 {
        self.episode_reward_history
            .iter()
            .copied()
            .reduce(f32::min)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use crate::test::corridor_test_environment::CorridorAction;

    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut b = RingBuffer::new(3);
        for i in 0..5 {
            b.add(i);
        }
        assert_eq!(b.len(), 3);
        assert_eq!(b.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(b.get_many_as_val(&[0, 2]), [2, 4]);
    }

    #[test]
    fn test_replay_buffer_keeps_transitions_aligned() {
        let mut b = ReplayBuffer::<usize, CorridorAction>::new(2, 10);
        b.add(CorridorAction::Left, Rc::new(0), Rc::new(1), 0.5, false);
        b.add(CorridorAction::Right, Rc::new(1), Rc::new(2), 1.0, false);
        b.add(CorridorAction::Right, Rc::new(2), Rc::new(3), 2.0, true);
        assert_eq!(b.len(), 2);

        let samples = b.get_many(&[1, 0]);
        assert_eq!(**samples.state[0], 2);
        assert_eq!(**samples.state_next[0], 3);
        assert_eq!(samples.reward, [2.0, 1.0]);
        assert_eq!(samples.done, [true, false]);
        assert_eq!(samples.action, [CorridorAction::Right, CorridorAction::Right]);
    }

    #[test]
    fn test_episode_reward_window() {
        let mut b = ReplayBuffer::<usize, CorridorAction>::new(1, 3);
        assert_eq!(b.avg_episode_reward(), 0.0);
        for r in [10.0, -2.0, 4.0, 1.0] {
            b.add_episode_reward(r);
        }
        assert_eq!(b.episode_rewards(), vec![-2.0, 4.0, 1.0]);
        assert_eq!(b.avg_episode_reward(), 1.0);
        assert_eq!(b.min_episode_reward(), -2.0);
    }
}
