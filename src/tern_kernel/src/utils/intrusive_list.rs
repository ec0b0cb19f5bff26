//! Intrusive doubly-linked lists over `'static` kernel objects.
//!
//! The links are embedded in the elements themselves, so linking and
//! unlinking never allocate. Both are permitted on an interrupt path.
//! All link fields live in [`CpuLockCell`]s, so every operation requires a
//! CPU Lock token.
use crate::klock::{CpuLockCell, CpuLockTokenRefMut};
use crate::utils::Init;

/// A membership link embedded in an element of type `T`.
///
/// `None` in the enclosing cell means the element is not in a list.
pub(crate) struct Link<T: 'static> {
    pub prev: Option<&'static T>,
    pub next: Option<&'static T>,
}

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Link<T> {}

/// The head of an intrusive list of elements of type `T`.
pub(crate) struct ListHead<T: 'static> {
    pub first: Option<&'static T>,
    pub last: Option<&'static T>,
}

impl<T> Clone for ListHead<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ListHead<T> {}

impl<T> Init for ListHead<T> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

impl<T> ListHead<T> {
    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Accessor for one intrusive list: the list head plus a projection from an
/// element to its link cell.
pub(crate) struct ListAccessor<'a, Traits: 'static, T: 'static, MapLink> {
    head: &'a CpuLockCell<Traits, ListHead<T>>,
    map_link: MapLink,
}

impl<'a, Traits: 'static, T: 'static, MapLink> ListAccessor<'a, Traits, T, MapLink>
where
    MapLink: Fn(&'static T) -> &'static CpuLockCell<Traits, Option<Link<T>>>,
{
    pub(crate) fn new(head: &'a CpuLockCell<Traits, ListHead<T>>, map_link: MapLink) -> Self {
        Self { head, map_link }
    }

    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.head.get(&*lock).is_empty()
    }

    pub(crate) fn front(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static T> {
        self.head.get(&*lock).first
    }

    /// Get the element following `elem`, or `None` if `elem` is the last one.
    ///
    /// `elem` must be linked.
    pub(crate) fn next(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        elem: &'static T,
    ) -> Option<&'static T> {
        (self.map_link)(elem).get(&*lock).expect("unlinked element").next
    }

    pub(crate) fn push_back(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        elem: &'static T,
    ) {
        debug_assert!((self.map_link)(elem).get(&*lock).is_none());

        let mut head = self.head.get(&*lock);
        match head.last {
            None => {
                head.first = Some(elem);
                head.last = Some(elem);
                (self.map_link)(elem).replace(
                    &mut *lock,
                    Some(Link {
                        prev: None,
                        next: None,
                    }),
                );
            }
            Some(last) => {
                let mut last_link = (self.map_link)(last).get(&*lock).expect("corrupt list");
                last_link.next = Some(elem);
                (self.map_link)(last).replace(&mut *lock, Some(last_link));
                (self.map_link)(elem).replace(
                    &mut *lock,
                    Some(Link {
                        prev: Some(last),
                        next: None,
                    }),
                );
                head.last = Some(elem);
            }
        }
        self.head.replace(&mut *lock, head);
    }

    pub(crate) fn push_front(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        elem: &'static T,
    ) {
        debug_assert!((self.map_link)(elem).get(&*lock).is_none());

        let mut head = self.head.get(&*lock);
        match head.first {
            None => {
                head.first = Some(elem);
                head.last = Some(elem);
                (self.map_link)(elem).replace(
                    &mut *lock,
                    Some(Link {
                        prev: None,
                        next: None,
                    }),
                );
            }
            Some(first) => {
                let mut first_link = (self.map_link)(first).get(&*lock).expect("corrupt list");
                first_link.prev = Some(elem);
                (self.map_link)(first).replace(&mut *lock, Some(first_link));
                (self.map_link)(elem).replace(
                    &mut *lock,
                    Some(Link {
                        prev: None,
                        next: Some(first),
                    }),
                );
                head.first = Some(elem);
            }
        }
        self.head.replace(&mut *lock, head);
    }

    /// Insert `elem` before `anchor`. `anchor == None` appends to the back.
    pub(crate) fn insert_before(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        elem: &'static T,
        anchor: Option<&'static T>,
    ) {
        let Some(anchor) = anchor else {
            self.push_back(lock, elem);
            return;
        };

        debug_assert!((self.map_link)(elem).get(&*lock).is_none());

        let mut anchor_link = (self.map_link)(anchor).get(&*lock).expect("corrupt list");
        let prev = anchor_link.prev;
        anchor_link.prev = Some(elem);
        (self.map_link)(anchor).replace(&mut *lock, Some(anchor_link));
        (self.map_link)(elem).replace(
            &mut *lock,
            Some(Link {
                prev,
                next: Some(anchor),
            }),
        );

        match prev {
            Some(prev) => {
                let mut prev_link = (self.map_link)(prev).get(&*lock).expect("corrupt list");
                prev_link.next = Some(elem);
                (self.map_link)(prev).replace(&mut *lock, Some(prev_link));
            }
            None => {
                let mut head = self.head.get(&*lock);
                head.first = Some(elem);
                self.head.replace(&mut *lock, head);
            }
        }
    }

    /// Unlink `elem`. `elem` must be in this list.
    pub(crate) fn remove(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        elem: &'static T,
    ) {
        let link = (self.map_link)(elem)
            .replace(&mut *lock, None)
            .expect("unlinked element");

        let mut head = self.head.get(&*lock);
        match link.prev {
            Some(prev) => {
                let mut prev_link = (self.map_link)(prev).get(&*lock).expect("corrupt list");
                prev_link.next = link.next;
                (self.map_link)(prev).replace(&mut *lock, Some(prev_link));
            }
            None => head.first = link.next,
        }
        match link.next {
            Some(next) => {
                let mut next_link = (self.map_link)(next).get(&*lock).expect("corrupt list");
                next_link.prev = link.prev;
                (self.map_link)(next).replace(&mut *lock, Some(next_link));
            }
            None => head.last = link.prev,
        }
        self.head.replace(&mut *lock, head);
    }

    pub(crate) fn pop_front(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static T> {
        let first = self.head.get(&*lock).first?;
        self.remove(lock.borrow_mut(), first);
        Some(first)
    }

    /// Move the front element to the back. Used for round-robin rotation and
    /// `yield`.
    pub(crate) fn rotate(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        if let Some(first) = self.pop_front(lock.borrow_mut()) {
            self.push_back(lock, first);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klock::{CpuLockCell, CpuLockToken};
    use quickcheck_macros::quickcheck;

    struct Node {
        val: usize,
        link: CpuLockCell<(), Option<Link<Node>>>,
    }

    fn node(val: usize) -> &'static Node {
        Box::leak(Box::new(Node {
            val,
            link: CpuLockCell::new(None),
        }))
    }

    #[quickcheck]
    fn matches_vec_model(bytecode: Vec<u8>) {
        // Safety: tests never instantiate a real CPU lock for `Traits = ()`
        let mut token = unsafe { CpuLockToken::<()>::new_unchecked() };
        let head: CpuLockCell<(), ListHead<Node>> = CpuLockCell::new(ListHead::INIT);
        let accessor = ListAccessor::new(&head, |n: &'static Node| &n.link);

        let mut model: Vec<&'static Node> = Vec::new();
        let mut ctr = 0;

        for op in bytecode {
            match op % 5 {
                0 => {
                    let n = node(ctr);
                    ctr += 1;
                    accessor.push_back(token.borrow_mut(), n);
                    model.push(n);
                }
                1 => {
                    let n = node(ctr);
                    ctr += 1;
                    accessor.push_front(token.borrow_mut(), n);
                    model.insert(0, n);
                }
                2 => {
                    let got = accessor.pop_front(token.borrow_mut());
                    let expected = if model.is_empty() {
                        None
                    } else {
                        Some(model.remove(0))
                    };
                    assert_eq!(got.map(|n| n.val), expected.map(|n| n.val));
                }
                3 => {
                    if !model.is_empty() {
                        let i = op as usize % model.len();
                        let n = model.remove(i);
                        accessor.remove(token.borrow_mut(), n);
                    }
                }
                _ => {
                    accessor.rotate(token.borrow_mut());
                    if !model.is_empty() {
                        let n = model.remove(0);
                        model.push(n);
                    }
                }
            }

            // The list must agree with the model after every operation
            let mut cursor = accessor.front(token.borrow_mut());
            for expected in &model {
                let n = cursor.expect("list too short");
                assert_eq!(n.val, expected.val);
                cursor = accessor.next(token.borrow_mut(), n);
            }
            assert!(cursor.is_none(), "list too long");
        }
    }

    #[test]
    fn insert_before_keeps_order() {
        let mut token = unsafe { CpuLockToken::<()>::new_unchecked() };
        let head: CpuLockCell<(), ListHead<Node>> = CpuLockCell::new(ListHead::INIT);
        let accessor = ListAccessor::new(&head, |n: &'static Node| &n.link);

        let (a, b, c) = (node(0), node(1), node(2));
        accessor.push_back(token.borrow_mut(), a);
        accessor.push_back(token.borrow_mut(), c);
        accessor.insert_before(token.borrow_mut(), b, Some(c));

        assert_eq!(accessor.front(token.borrow_mut()).unwrap().val, 0);
        assert_eq!(accessor.next(token.borrow_mut(), a).unwrap().val, 1);
        assert_eq!(accessor.next(token.borrow_mut(), b).unwrap().val, 2);
        assert!(accessor.next(token.borrow_mut(), c).is_none());
    }
}
