use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type FlushFn<T> = Box<dyn FnMut(&mut T) + Send>;

/// Cloneable handle that marks a scheduler dirty from anywhere, including
/// from inside its own flush callback.
#[derive(Clone, Debug, Default)]
pub struct DirtyMarker(Arc<AtomicBool>);

impl DirtyMarker {
    pub fn mark_dirty(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Coalesces redraw requests into at most one flush per refresh tick.
///
/// The tick is driven from outside (the frontend's refresh clock); the
/// scheduler never assumes an interval. `T` is whatever the flush callback
/// renders from, handed in by the caller on each tick so the callback
/// doesn't need to own it.
pub struct RenderScheduler<T> {
    dirty: DirtyMarker,
    flush: Option<FlushFn<T>>,
}

impl<T> Default for RenderScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RenderScheduler<T> {
    pub fn new() -> Self {
        Self {
            dirty: DirtyMarker::default(),
            flush: None,
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.mark_dirty();
    }

    pub fn marker(&self) -> DirtyMarker {
        self.dirty.clone()
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty.is_dirty()
    }

    /// Register the flush callback, replacing any previous one.
    pub fn on_flush<F>(&mut self, callback: F)
    where
        F: FnMut(&mut T) + Send + 'static,
    {
        self.flush = Some(Box::new(callback));
    }

    /// Drop the flush registration. Dirty state is kept.
    pub fn clear_flush(&mut self) {
        self.flush = None;
    }

    /// One refresh tick. Runs the flush callback if anything was marked
    /// since the previous flush and returns whether it ran.
    ///
    /// The dirty flag is taken before the callback runs, so a mark made
    /// during the flush carries over to the next tick.
    pub fn tick(&mut self, target: &mut T) -> bool {
        let Some(flush) = self.flush.as_mut() else {
            return false;
        };
        if !self.dirty.0.swap(false, Ordering::AcqRel) {
            return false;
        }
        flush(target);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifty_marks_in_one_tick_flush_once() {
        let mut scheduler = RenderScheduler::<u32>::new();
        scheduler.on_flush(|count| *count += 1);
        let mut flushed = 0;

        for _ in 0..50 {
            scheduler.mark_dirty();
        }
        assert!(scheduler.tick(&mut flushed));
        assert_eq!(flushed, 1);

        assert!(!scheduler.tick(&mut flushed));
        assert_eq!(flushed, 1);
    }

    #[test]
    fn no_mark_no_flush() {
        let mut scheduler = RenderScheduler::<u32>::new();
        scheduler.on_flush(|count| *count += 1);
        let mut flushed = 0;
        for _ in 0..5 {
            scheduler.tick(&mut flushed);
        }
        assert_eq!(flushed, 0);
    }

    #[test]
    fn mark_during_flush_is_honored_next_tick() {
        let mut scheduler = RenderScheduler::<Vec<&'static str>>::new();
        let marker = scheduler.marker();
        let mut remark = true;
        scheduler.on_flush(move |log| {
            log.push("flush");
            if remark {
                remark = false;
                marker.mark_dirty();
            }
        });

        let mut log = Vec::new();
        scheduler.mark_dirty();
        assert!(scheduler.tick(&mut log));
        assert!(scheduler.is_dirty());
        assert!(scheduler.tick(&mut log));
        assert!(!scheduler.tick(&mut log));
        assert_eq!(log, vec!["flush", "flush"]);
    }

    #[test]
    fn marks_from_a_cloned_marker_coalesce() {
        let mut scheduler = RenderScheduler::<u32>::new();
        scheduler.on_flush(|count| *count += 1);
        let markers: Vec<_> = (0..4).map(|_| scheduler.marker()).collect();
        for marker in &markers {
            marker.mark_dirty();
        }
        let mut flushed = 0;
        scheduler.tick(&mut flushed);
        scheduler.tick(&mut flushed);
        assert_eq!(flushed, 1);
    }

    #[test]
    fn cleared_registration_keeps_pending_mark() {
        let mut scheduler = RenderScheduler::<u32>::new();
        scheduler.on_flush(|count| *count += 1);
        scheduler.clear_flush();
        scheduler.mark_dirty();
        let mut flushed = 0;
        assert!(!scheduler.tick(&mut flushed));
        assert!(scheduler.is_dirty());

        scheduler.on_flush(|count| *count += 10);
        assert!(scheduler.tick(&mut flushed));
        assert_eq!(flushed, 10);
    }
}
