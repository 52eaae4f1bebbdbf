//! Intrusive doubly linked list over nodes living in allocator-owned memory.

use core::{marker::PhantomData, ptr::null_mut};

pub(crate) struct ListLink<T> {
  prev: *mut T,
  next: *mut T,
}

impl<T> ListLink<T> {
  pub(crate) const fn new() -> Self {
    Self {
      prev: null_mut(),
      next: null_mut(),
    }
  }
}

/// Locates the link embedded in a node.
pub(crate) trait ListAdapter {
  type Node;

  fn link(node: *mut Self::Node) -> *mut ListLink<Self::Node>;
}

pub(crate) struct List<A: ListAdapter> {
  head: *mut A::Node,
  tail: *mut A::Node,
  _adapter: PhantomData<A>,
}

impl<A: ListAdapter> List<A> {
  pub(crate) const fn new() -> Self {
    Self {
      head: null_mut(),
      tail: null_mut(),
      _adapter: PhantomData,
    }
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  #[inline]
  pub(crate) fn front(&self) -> *mut A::Node {
    self.head
  }

  /// True if `node` is linked. Only valid when `node` is either in this list
  /// or not in any list using the same link.
  pub(crate) unsafe fn contains(&self, node: *mut A::Node) -> bool {
    let link = A::link(node);
    unsafe { !(*link).prev.is_null() || !(*link).next.is_null() || self.head == node }
  }

  pub(crate) unsafe fn push_front(&mut self, node: *mut A::Node) {
    unsafe {
      let link = A::link(node);
      (*link).prev = null_mut();
      (*link).next = self.head;
      if self.head.is_null() {
        self.tail = node;
      } else {
        (*A::link(self.head)).prev = node;
      }
      self.head = node;
    }
  }

  pub(crate) unsafe fn push_back(&mut self, node: *mut A::Node) {
    unsafe {
      let link = A::link(node);
      (*link).next = null_mut();
      (*link).prev = self.tail;
      if self.tail.is_null() {
        self.head = node;
      } else {
        (*A::link(self.tail)).next = node;
      }
      self.tail = node;
    }
  }

  pub(crate) unsafe fn remove(&mut self, node: *mut A::Node) {
    unsafe {
      let link = A::link(node);
      let (prev, next) = ((*link).prev, (*link).next);
      if prev.is_null() {
        debug_assert!(self.head == node, "removing a node that is not linked");
        self.head = next;
      } else {
        (*A::link(prev)).next = next;
      }
      if next.is_null() {
        self.tail = prev;
      } else {
        (*A::link(next)).prev = prev;
      }
      (*link).prev = null_mut();
      (*link).next = null_mut();
    }
  }

  pub(crate) unsafe fn pop_front(&mut self) -> *mut A::Node {
    let node = self.head;
    if !node.is_null() {
      unsafe { self.remove(node) };
    }
    node
  }

  /// Walks the list front to back. The current node may not be unlinked
  /// while iterating.
  pub(crate) fn iter(&self) -> ListIter<'_, A> {
    ListIter {
      cur: self.head,
      _list: PhantomData,
    }
  }
}

pub(crate) struct ListIter<'a, A: ListAdapter> {
  cur: *mut A::Node,
  _list: PhantomData<&'a List<A>>,
}

impl<A: ListAdapter> Iterator for ListIter<'_, A> {
  type Item = *mut A::Node;

  fn next(&mut self) -> Option<Self::Item> {
    if self.cur.is_null() {
      return None;
    }
    let node = self.cur;
    self.cur = unsafe { (*A::link(node)).next };
    Some(node)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Item {
    value: u32,
    link: ListLink<Item>,
  }

  struct ItemList;

  impl ListAdapter for ItemList {
    type Node = Item;

    fn link(node: *mut Item) -> *mut ListLink<Item> {
      unsafe { &raw mut (*node).link }
    }
  }

  fn items(n: u32) -> Vec<Item> {
    (0..n)
      .map(|value| Item {
        value,
        link: ListLink::new(),
      })
      .collect()
  }

  fn values(list: &List<ItemList>) -> Vec<u32> {
    list.iter().map(|n| unsafe { (*n).value }).collect()
  }

  #[test]
  fn push_remove_pop() {
    let mut storage = items(4);
    let p: Vec<*mut Item> = storage.iter_mut().map(|i| i as *mut Item).collect();
    let mut list = List::<ItemList>::new();
    unsafe {
      list.push_back(p[1]);
      list.push_front(p[0]);
      list.push_back(p[2]);
      assert_eq!(values(&list), [0, 1, 2]);
      assert!(list.contains(p[1]));
      assert!(!list.contains(p[3]));

      list.remove(p[1]);
      assert!(!list.contains(p[1]));
      assert_eq!(values(&list), [0, 2]);

      assert_eq!(list.pop_front(), p[0]);
      assert_eq!(list.pop_front(), p[2]);
      assert!(list.is_empty());
      assert!(list.pop_front().is_null());
    }
  }

  #[test]
  fn single_element_is_contained() {
    let mut storage = items(1);
    let p = &mut storage[0] as *mut Item;
    let mut list = List::<ItemList>::new();
    unsafe {
      list.push_front(p);
      assert!(list.contains(p));
      list.remove(p);
      assert!(list.is_empty());
    }
  }
}
