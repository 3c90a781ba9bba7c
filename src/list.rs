//! Fan-in over many deferreds
//!
//! A [`DeferredList`] watches a set of child deferreds and fires once,
//! either on the first success, on the first failure, or when every child
//! has fired, depending on how it was built.

use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use crate::deferred::{Deferred, Resolver};
use crate::error::{DeferredError, Failure};

/// What a [`DeferredList`] fires with
#[derive(Debug, Clone, PartialEq)]
pub enum ListResult<T> {
    /// The first child to succeed, with `fire_on_one_callback`
    First { index: usize, value: T },
    /// Every child's result, in the order the children were given
    All(Vec<Result<T, Failure>>),
}

impl<T> ListResult<T> {
    /// The per-child results of an `All`
    pub fn into_all(self) -> Option<Vec<Result<T, Failure>>> {
        match self {
            ListResult::All(results) => Some(results),
            ListResult::First { .. } => None,
        }
    }
}

struct ListState<T> {
    results: Vec<Option<Result<T, Failure>>>,
    finished: usize,
}

/// A deferred that fires from the results of its children
pub struct DeferredList<T: 'static> {
    deferred: Deferred<ListResult<T>>,
    children: Vec<Deferred<T>>,
    state: Rc<RefCell<ListState<T>>>,
}

/// Options for a [`DeferredList`]
pub struct ListBuilder<T: 'static> {
    children: Vec<Deferred<T>>,
    fire_on_one_callback: bool,
    fire_on_one_errback: bool,
    /// Set by `consume_errors`: what an absorbed failure is replaced with
    absorb: Option<Rc<dyn Fn() -> T>>,
    canceller: Option<Box<dyn FnOnce(&Resolver<ListResult<T>>)>>,
}

impl<T: Clone + 'static> ListBuilder<T> {
    /// Fire with the first child that succeeds
    pub fn fire_on_one_callback(mut self, enabled: bool) -> Self {
        self.fire_on_one_callback = enabled;
        self
    }

    /// Fail with the first child that fails
    pub fn fire_on_one_errback(mut self, enabled: bool) -> Self {
        self.fire_on_one_errback = enabled;
        self
    }

    /// Stop child failures at the list instead of letting them continue
    /// down each child's own chain
    ///
    /// Links added to a child after the list see `T::default()` in place of
    /// the absorbed failure.
    pub fn consume_errors(mut self, enabled: bool) -> Self
    where
        T: Default,
    {
        let absorb: Rc<dyn Fn() -> T> = Rc::new(T::default);
        self.absorb = enabled.then_some(absorb);
        self
    }

    pub fn canceller<C>(mut self, canceller: C) -> Self
    where
        C: FnOnce(&Resolver<ListResult<T>>) + 'static,
    {
        self.canceller = Some(Box::new(canceller));
        self
    }

    /// Attach to every child and return the list
    ///
    /// Fails, leaving every child untouched, if one of them can no longer be
    /// observed (finalized, chained into another deferred, or handed off).
    pub fn build(self) -> Result<DeferredList<T>, DeferredError> {
        for child in &self.children {
            child.check_appendable()?;
        }

        let deferred = match self.canceller {
            Some(canceller) => Deferred::with_canceller(canceller),
            None => Deferred::new(),
        };
        let count = self.children.len();
        let state = Rc::new(RefCell::new(ListState {
            results: (0..count).map(|_| None).collect(),
            finished: 0,
        }));

        tracing::debug!(list = %deferred.id(), children = count, "deferred list created");
        if count == 0 {
            deferred.resolve(Ok(ListResult::All(Vec::new())));
        }

        for (index, child) in self.children.iter().enumerate() {
            let list = deferred.clone();
            let state = state.clone();
            let fire_on_one_callback = self.fire_on_one_callback;
            let fire_on_one_errback = self.fire_on_one_errback;
            let absorb = self.absorb.clone();

            child.add_observer(move |result| {
                let all = {
                    let mut state = state.borrow_mut();
                    state.results[index] = Some(result.clone());
                    state.finished += 1;
                    if state.finished == count {
                        Some(
                            state
                                .results
                                .iter()
                                .map(|slot| slot.clone().unwrap_or(Err(Failure::Cancelled)))
                                .collect::<Vec<_>>(),
                        )
                    } else {
                        None
                    }
                };

                let early = match &result {
                    Ok(value) if fire_on_one_callback => Some(Ok(ListResult::First {
                        index,
                        value: value.clone(),
                    })),
                    Err(failure) if fire_on_one_errback => Some(Err(Failure::FirstError {
                        index,
                        cause: Box::new(failure.clone()),
                    })),
                    _ => None,
                };

                if !list.is_fired() {
                    if let Some(early) = early {
                        tracing::debug!(list = %list.id(), index, "deferred list fired early");
                        list.resolve(early);
                    } else if let Some(all) = all {
                        tracing::debug!(list = %list.id(), "every child of the deferred list fired");
                        list.resolve(Ok(ListResult::All(all)));
                    }
                }

                match (result, absorb) {
                    (Err(_), Some(absorb)) => {
                        tracing::trace!(list = %list.id(), index, "child failure consumed");
                        Ok(absorb())
                    }
                    (other, _) => other,
                }
            })?;
        }

        Ok(DeferredList {
            deferred,
            children: self.children,
            state,
        })
    }
}

impl<T: Clone + 'static> DeferredList<T> {
    /// A list that fires when every child has fired
    pub fn new(children: Vec<Deferred<T>>) -> Result<Self, DeferredError> {
        Self::builder(children).build()
    }

    pub fn builder(children: Vec<Deferred<T>>) -> ListBuilder<T> {
        ListBuilder {
            children,
            fire_on_one_callback: false,
            fire_on_one_errback: false,
            absorb: None,
            canceller: None,
        }
    }

    /// Number of children that have fired so far
    pub fn finished_count(&self) -> usize {
        self.state.borrow().finished
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> &[Deferred<T>] {
        &self.children
    }

    /// Per-child results recorded so far, `None` for children still pending
    pub fn results(&self) -> Vec<Option<Result<T, Failure>>> {
        self.state.borrow().results.clone()
    }

    /// The list's own deferred
    pub fn deferred(&self) -> &Deferred<ListResult<T>> {
        &self.deferred
    }

    pub fn into_deferred(self) -> Deferred<ListResult<T>> {
        self.deferred
    }
}

impl<T: 'static> Deref for DeferredList<T> {
    type Target = Deferred<ListResult<T>>;

    fn deref(&self) -> &Self::Target {
        &self.deferred
    }
}

impl<T: 'static> fmt::Debug for DeferredList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredList")
            .field("deferred", &self.deferred)
            .field("children", &self.children.len())
            .finish()
    }
}

/// Collect the values of every child, failing on the first failure
pub fn gather_results<T: Clone + 'static>(
    children: Vec<Deferred<T>>,
) -> Result<Deferred<Vec<T>>, DeferredError> {
    let list = DeferredList::builder(children)
        .fire_on_one_errback(true)
        .build()?;
    list.map_into(|result| match result {
        ListResult::All(results) => results.into_iter().collect(),
        ListResult::First { value, .. } => Ok(vec![value]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::{FiringState, Outcome};
    use std::cell::Cell;

    #[test]
    fn test_empty_list_fires_immediately() {
        let list = DeferredList::<i32>::new(Vec::new()).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.state(), FiringState::Succeeded);
        assert_eq!(list.result().unwrap().unwrap(), ListResult::All(vec![]));
    }

    #[test]
    fn test_fires_when_all_children_fire() {
        let children: Vec<Deferred<i32>> = (0..3).map(|_| Deferred::new()).collect();
        let list = DeferredList::new(children.clone()).unwrap();

        children[2].callback(30).unwrap();
        children[0].callback(10).unwrap();
        assert_eq!(list.finished_count(), 2);
        assert!(!list.is_fired());

        children[1].errback(Failure::msg("x")).unwrap();
        let all = list.result().unwrap().unwrap().into_all().unwrap();
        assert_eq!(all[0], Ok(10));
        assert_eq!(all[1], Err(Failure::msg("x")));
        assert_eq!(all[2], Ok(30));
        // not consumed: the child still carries its failure
        assert_eq!(children[1].state(), FiringState::Failed);
    }

    #[test]
    fn test_fire_on_one_callback() {
        let children: Vec<Deferred<i32>> = (0..3).map(|_| Deferred::new()).collect();
        let list = DeferredList::builder(children.clone())
            .fire_on_one_callback(true)
            .build()
            .unwrap();

        children[1].errback(Failure::msg("first failure")).unwrap();
        assert!(!list.is_fired());
        children[2].callback(7).unwrap();
        assert_eq!(
            list.result().unwrap().unwrap(),
            ListResult::First { index: 2, value: 7 }
        );
        children[0].callback(1).unwrap();
        assert_eq!(list.finished_count(), 3);
        assert_eq!(
            list.result().unwrap().unwrap(),
            ListResult::First { index: 2, value: 7 }
        );
        let results = list.results();
        assert_eq!(results[0], Some(Ok(1)));
        assert_eq!(results[2], Some(Ok(7)));
    }

    #[test]
    fn test_fire_on_one_errback() {
        let children: Vec<Deferred<i32>> = (0..2).map(|_| Deferred::new()).collect();
        let list = DeferredList::builder(children.clone())
            .fire_on_one_errback(true)
            .build()
            .unwrap();
        children[0].callback(1).unwrap();
        children[1].errback(Failure::msg("bad")).unwrap();
        match list.result() {
            Some(Err(Failure::FirstError { index, cause })) => {
                assert_eq!(index, 1);
                assert_eq!(*cause, Failure::msg("bad"));
            }
            other => panic!("unexpected list result: {:?}", other),
        }
    }

    #[test]
    fn test_consume_errors_stops_child_failures() {
        let child = Deferred::<i32>::new();
        let saw_failure = Rc::new(Cell::new(false));
        let _list = DeferredList::builder(vec![child.clone()])
            .consume_errors(true)
            .build()
            .unwrap();
        let flag = saw_failure.clone();
        child
            .add_errback(move |f| {
                flag.set(true);
                Outcome::Failure(f)
            })
            .unwrap();

        child.errback(Failure::msg("absorbed")).unwrap();
        assert!(!saw_failure.get());
        assert_eq!(child.result(), Some(Ok(0)));
        assert_eq!(child.state(), FiringState::Succeeded);
    }

    #[test]
    fn test_consumed_child_still_feeds_second_list() {
        let child = Deferred::<i32>::new();
        let consuming = DeferredList::builder(vec![child.clone()])
            .consume_errors(true)
            .build()
            .unwrap();
        let plain = DeferredList::new(vec![child.clone()]).unwrap();
        let both_ran = Rc::new(Cell::new(false));
        let flag = both_ran.clone();
        child
            .add_both(move |result| {
                flag.set(true);
                Outcome::from(result)
            })
            .unwrap();

        child.errback(Failure::msg("first list keeps this")).unwrap();

        assert_eq!(
            consuming.result().unwrap().unwrap(),
            ListResult::All(vec![Err(Failure::msg("first list keeps this"))])
        );
        assert!(plain.is_fired());
        assert_eq!(plain.finished_count(), 1);
        assert_eq!(plain.result().unwrap().unwrap(), ListResult::All(vec![Ok(0)]));
        assert!(both_ran.get());
    }

    #[test]
    fn test_rejected_build_leaves_children_untouched() {
        let free = Deferred::<i32>::new();
        let taken = Deferred::<i32>::new();
        let parent = Deferred::<i32>::new();
        let handed = taken.clone();
        parent.add_callback(move |_| Outcome::Nested(handed)).unwrap();
        parent.callback(0).unwrap();

        let built = DeferredList::builder(vec![free.clone(), taken])
            .consume_errors(true)
            .build();
        assert!(matches!(built, Err(DeferredError::ChainOrigin(_))));

        let errback_ran = Rc::new(Cell::new(false));
        let flag = errback_ran.clone();
        free.add_errback(move |f| {
            flag.set(true);
            Outcome::Failure(f)
        })
        .unwrap();
        free.errback(Failure::msg("kept")).unwrap();
        assert!(errback_ran.get());
        assert_eq!(free.result(), Some(Err(Failure::msg("kept"))));
    }

    #[test]
    fn test_handed_off_child_is_rejected() {
        let child = Deferred::<i32>::new();
        let _future = child.to_future().unwrap();
        assert!(matches!(
            DeferredList::new(vec![child]),
            Err(DeferredError::HandedOff(_))
        ));
    }

    #[test]
    fn test_children_already_fired() {
        let list = DeferredList::new(vec![Deferred::succeed(1), Deferred::succeed(2)]).unwrap();
        assert_eq!(
            list.result().unwrap().unwrap(),
            ListResult::All(vec![Ok(1), Ok(2)])
        );
    }

    #[test]
    fn test_chained_child_is_rejected() {
        let child = Deferred::<i32>::new();
        let parent = Deferred::<i32>::new();
        let handed = child.clone();
        parent.add_callback(move |_| Outcome::Nested(handed)).unwrap();
        parent.callback(0).unwrap();
        assert!(matches!(
            DeferredList::new(vec![child]),
            Err(DeferredError::ChainOrigin(_))
        ));
    }

    #[test]
    fn test_gather_results() {
        let children: Vec<Deferred<i32>> = (0..3).map(|_| Deferred::new()).collect();
        let gathered = gather_results(children.clone()).unwrap();
        for (i, child) in children.iter().enumerate() {
            child.callback(i as i32 * 2).unwrap();
        }
        assert_eq!(gathered.result().unwrap().unwrap(), vec![0, 2, 4]);

        let children: Vec<Deferred<i32>> = (0..2).map(|_| Deferred::new()).collect();
        let gathered = gather_results(children.clone()).unwrap();
        children[1].errback(Failure::msg("broken")).unwrap();
        assert!(matches!(
            gathered.result(),
            Some(Err(Failure::FirstError { index: 1, .. }))
        ));
    }

    #[test]
    fn test_cancel_list_with_canceller() {
        let cancelled = Rc::new(Cell::new(false));
        let flag = cancelled.clone();
        let list = DeferredList::builder(vec![Deferred::<i32>::new()])
            .canceller(move |resolver| {
                flag.set(true);
                resolver.errback(Failure::Cancelled).unwrap();
            })
            .build()
            .unwrap();
        list.cancel();
        assert!(cancelled.get());
        assert!(matches!(list.result(), Some(Err(Failure::Cancelled))));
    }
}
