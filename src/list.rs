//! Intrusive circular timer lists.
//!
//! Every wheel slot, the expired list and each run queue owns one
//! [`TimerList`]: a circular doubly-linked list threaded through the
//! entries' own link cells, with a sentinel [`Timer`] as the head. The head
//! stores the list's `(wheel, idx)` tag; insertion stamps the tag into each
//! member's packed info word so a deleter can find the lock that owns the
//! entry from the entry alone.
//!
//! A detached entry is unambiguous: it is self-linked (`next == self`) or
//! has null links. Misuse (inserting a linked entry, removing a detached
//! one, removing through the wrong list) is a fatal bug: the operations
//! assert their preconditions.
//!
//! There is no internal locking. The caller must hold the lock that guards
//! the list (see the locking discipline in [`crate::timer`]); all
//! operations take `&self` and go through the entries' link cells.

use std::ptr::NonNull;

use crate::timer::{Timer, FLAG_HEAD};
use crate::wheel::{NO_IDX, WHEEL_NONE};

/// A circular doubly-linked list of timer entries with a sentinel head.
pub(crate) struct TimerList {
    head: Timer,
    wheel_no: u8,
    wheel_idx: u16,
}

// SAFETY: access is guarded by the owning scheduler lock; see module docs.
unsafe impl Send for TimerList {}
unsafe impl Sync for TimerList {}

impl TimerList {
    /// Creates a list for the given wheel slot. The head is left unlinked;
    /// call [`init_head`] once the list has reached its final address.
    ///
    /// [`init_head`]: TimerList::init_head
    pub(crate) fn new(wheel_no: u8, wheel_idx: u16) -> Self {
        Self {
            head: Timer::new(),
            wheel_no,
            wheel_idx,
        }
    }

    /// Links the sentinel head to itself and tags it. Must be called before
    /// any other operation, after the list has stopped moving in memory
    /// (the head is self-referential from here on).
    pub(crate) fn init_head(&self) {
        self.head.self_link();
        self.head.info.set_flags(FLAG_HEAD);
        self.head.info.set_wheel(self.wheel_no, self.wheel_idx);
    }

    pub(crate) fn wheel_no(&self) -> u8 {
        self.wheel_no
    }

    pub(crate) fn wheel_idx(&self) -> u16 {
        self.wheel_idx
    }

    pub(crate) fn head_ptr(&self) -> NonNull<Timer> {
        NonNull::from(&self.head)
    }

    /// Exposes the sentinel for structural checks in tests.
    #[cfg(test)]
    pub(crate) fn head(&self) -> &Timer {
        &self.head
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self.head.next_link() {
            Some(n) => n == self.head_ptr(),
            // head never initialised: nothing was ever linked
            None => true,
        }
    }

    /// Returns the first entry, if any.
    pub(crate) fn first(&self) -> Option<NonNull<Timer>> {
        let n = self.head.next_link()?;
        (n != self.head_ptr()).then_some(n)
    }

    /// Pushes `e` right after the head.
    ///
    /// # Safety
    ///
    /// `e` must point to a live entry and the caller must hold the lock
    /// guarding this list.
    #[allow(dead_code)]
    pub(crate) unsafe fn insert(&self, e: NonNull<Timer>) {
        let er = e.as_ref();
        assert!(
            er.detached(),
            "insert of linked entry on list {}/{}, entry tag {:?}",
            self.wheel_no,
            self.wheel_idx,
            er.info
        );
        let head = self.head_ptr();
        let next = self.head.next_link().expect("list head not initialised");

        er.set_prev(Some(head));
        er.set_next(Some(next));
        next.as_ref().set_prev(Some(e));
        self.head.set_next(Some(e));

        let (w, idx) = er.info.wheel_pos();
        assert!(
            w == WHEEL_NONE && idx == NO_IDX,
            "insert of entry still tagged to {w}/{idx} into {}/{}",
            self.wheel_no,
            self.wheel_idx
        );
        er.info.set_wheel(self.wheel_no, self.wheel_idx);
    }

    /// Pushes `e` at the tail, right before the head.
    ///
    /// # Safety
    ///
    /// Same contract as [`insert`](TimerList::insert).
    pub(crate) unsafe fn append(&self, e: NonNull<Timer>) {
        let er = e.as_ref();
        assert!(
            er.detached(),
            "append of linked entry on list {}/{}, entry tag {:?}",
            self.wheel_no,
            self.wheel_idx,
            er.info
        );
        let head = self.head_ptr();
        let prev = self.head.prev_link().expect("list head not initialised");

        er.set_prev(Some(prev));
        er.set_next(Some(head));
        prev.as_ref().set_next(Some(e));
        self.head.set_prev(Some(e));

        let (w, idx) = er.info.wheel_pos();
        assert!(
            w == WHEEL_NONE && idx == NO_IDX,
            "append of entry still tagged to {w}/{idx} into {}/{}",
            self.wheel_no,
            self.wheel_idx
        );
        er.info.set_wheel(self.wheel_no, self.wheel_idx);
    }

    /// Unlinks `e`, leaves it self-linked and clears its wheel tag.
    ///
    /// # Safety
    ///
    /// `e` must point to a live entry that is a member of this list, and
    /// the caller must hold the lock guarding this list.
    pub(crate) unsafe fn remove(&self, e: NonNull<Timer>) {
        assert!(
            e != self.head_ptr(),
            "remove of the list head {}/{}",
            self.wheel_no,
            self.wheel_idx
        );
        let er = e.as_ref();
        let (next, prev) = (er.next_link(), er.prev_link());
        let (Some(next), Some(prev)) = (next, prev) else {
            panic!(
                "remove of null-detached entry from list {}/{}",
                self.wheel_no, self.wheel_idx
            );
        };
        assert!(
            next != e && prev != e,
            "remove of detached entry from {}/{}: {:?}",
            self.wheel_no,
            self.wheel_idx,
            er.info
        );

        prev.as_ref().set_next(Some(next));
        next.as_ref().set_prev(Some(prev));
        er.self_link();

        let (w, idx) = er.info.wheel_pos();
        assert!(
            w == self.wheel_no && idx == self.wheel_idx,
            "remove through the wrong list: entry on {w}/{idx}, list {}/{}",
            self.wheel_no,
            self.wheel_idx
        );
        er.info.set_wheel(WHEEL_NONE, NO_IDX);
    }

    /// Detaches the sublist `s ..= e` (both members of this list), leaving
    /// it circular on its own and every member tagged detached. Returns
    /// `false` when the head was passed in (empty or misused call).
    ///
    /// # Safety
    ///
    /// `s` and `e` must be members of this list in order, and the caller
    /// must hold the lock guarding this list.
    pub(crate) unsafe fn remove_sublist(&self, s: NonNull<Timer>, e: NonNull<Timer>) -> bool {
        let head = self.head_ptr();
        if s == head || e == head {
            return false;
        }
        let sr = s.as_ref();
        let er = e.as_ref();
        assert!(
            sr.next_link().is_some() && er.next_link().is_some(),
            "remove_sublist with null-detached bounds on {}/{}",
            self.wheel_no,
            self.wheel_idx
        );

        let before = sr.prev_link().expect("sublist start unlinked");
        let after = er.next_link().expect("sublist end unlinked");
        before.as_ref().set_next(Some(after));
        after.as_ref().set_prev(Some(before));
        // close the detached part into its own ring
        sr.set_prev(Some(e));
        er.set_next(Some(s));

        let mut v = s;
        loop {
            v.as_ref().info.set_wheel(WHEEL_NONE, NO_IDX);
            if v == e {
                break;
            }
            v = v.as_ref().next_link().expect("sublist ring broken");
        }
        true
    }

    /// Splices the detached ring `s ..= e` right after the head and tags
    /// every member with this list's wheel/slot.
    ///
    /// # Safety
    ///
    /// `s ..= e` must form a detached circular sublist; the caller must
    /// hold the lock guarding this list.
    #[allow(dead_code)]
    pub(crate) unsafe fn insert_sublist(&self, s: NonNull<Timer>, e: NonNull<Timer>) {
        let head = self.head_ptr();
        let first = self.head.next_link().expect("list head not initialised");
        s.as_ref().set_prev(Some(head));
        e.as_ref().set_next(Some(first));
        first.as_ref().set_prev(Some(e));
        self.head.set_next(Some(s));
        self.tag_sublist(s, e);
    }

    /// Splices the detached ring `s ..= e` at the tail and tags every
    /// member with this list's wheel/slot.
    ///
    /// # Safety
    ///
    /// Same contract as [`insert_sublist`](TimerList::insert_sublist).
    pub(crate) unsafe fn append_sublist(&self, s: NonNull<Timer>, e: NonNull<Timer>) {
        let head = self.head_ptr();
        let last = self.head.prev_link().expect("list head not initialised");
        s.as_ref().set_prev(Some(last));
        e.as_ref().set_next(Some(head));
        last.as_ref().set_next(Some(s));
        self.head.set_prev(Some(e));
        self.tag_sublist(s, e);
    }

    unsafe fn tag_sublist(&self, s: NonNull<Timer>, e: NonNull<Timer>) {
        let mut v = s;
        loop {
            v.as_ref().info.set_wheel(self.wheel_no, self.wheel_idx);
            if v == e {
                break;
            }
            v = v.as_ref().next_link().expect("sublist ring broken");
        }
    }

    /// Moves every entry of this list to the tail of `dst`. Returns `true`
    /// if anything moved.
    ///
    /// # Safety
    ///
    /// The caller must hold the locks guarding both lists.
    pub(crate) unsafe fn move_all_to(&self, dst: &TimerList) -> bool {
        let Some(s) = self.first() else {
            return false;
        };
        let e = self.head.prev_link().expect("list head not initialised");
        if !self.remove_sublist(s, e) {
            return false;
        }
        dst.append_sublist(s, e);
        true
    }

    /// Calls `f` for every entry, stopping early when it returns `false`.
    /// `f` must not unlink entries; use
    /// [`for_each_safe_remove`](TimerList::for_each_safe_remove) for that.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock guarding this list.
    #[allow(dead_code)]
    pub(crate) unsafe fn for_each(&self, mut f: impl FnMut(NonNull<Timer>) -> bool) {
        let head = self.head_ptr();
        let mut v = self.head.next_link().expect("list head not initialised");
        while v != head {
            let next = v.as_ref().next_link().expect("list ring broken");
            if !f(v) {
                break;
            }
            v = next;
        }
    }

    /// Like [`for_each`](TimerList::for_each), but `f` may remove the
    /// element it is handed (and only that one).
    ///
    /// # Safety
    ///
    /// The caller must hold the lock guarding this list.
    pub(crate) unsafe fn for_each_safe_remove(
        &self,
        mut f: impl FnMut(&TimerList, NonNull<Timer>) -> bool,
    ) {
        let head = self.head_ptr();
        let mut v = self.head.next_link().expect("list head not initialised");
        while v != head {
            let next = v.as_ref().next_link().expect("list ring broken");
            if !f(self, v) {
                break;
            }
            v = next;
        }
    }
}
