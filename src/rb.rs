//! Intrusive red-black tree.
//!
//! Nodes embed an [`RbLink`] and live in allocator-owned memory, so the tree
//! never allocates. Lookups take a closure comparing the search key against a
//! node, which lets callers search by partial keys such as "(size, lowest
//! address)" or "address within bounds" without building a key node.

use core::{cmp::Ordering, marker::PhantomData, ptr::null_mut};

pub(crate) struct RbLink<T> {
  left: *mut T,
  right: *mut T,
  parent: *mut T,
  red: bool,
}

impl<T> RbLink<T> {
  pub(crate) const fn new() -> Self {
    Self {
      left: null_mut(),
      right: null_mut(),
      parent: null_mut(),
      red: false,
    }
  }
}

pub(crate) trait RbAdapter {
  type Node;

  fn link(node: *mut Self::Node) -> *mut RbLink<Self::Node>;

  /// Total order used for insertion. Distinct nodes never compare equal.
  fn compare(a: *mut Self::Node, b: *mut Self::Node) -> Ordering;
}

pub(crate) struct RbTree<A: RbAdapter> {
  root: *mut A::Node,
  _adapter: PhantomData<A>,
}

#[inline(always)]
fn link<'a, A: RbAdapter>(n: *mut A::Node) -> &'a mut RbLink<A::Node> {
  debug_assert!(!n.is_null());
  unsafe { &mut *A::link(n) }
}

#[inline(always)]
fn left<A: RbAdapter>(n: *mut A::Node) -> *mut A::Node {
  link::<A>(n).left
}

#[inline(always)]
fn right<A: RbAdapter>(n: *mut A::Node) -> *mut A::Node {
  link::<A>(n).right
}

#[inline(always)]
fn parent<A: RbAdapter>(n: *mut A::Node) -> *mut A::Node {
  link::<A>(n).parent
}

#[inline(always)]
fn is_red<A: RbAdapter>(n: *mut A::Node) -> bool {
  !n.is_null() && link::<A>(n).red
}

#[inline(always)]
fn set_red<A: RbAdapter>(n: *mut A::Node, red: bool) {
  link::<A>(n).red = red;
}

impl<A: RbAdapter> RbTree<A> {
  pub(crate) const fn new() -> Self {
    Self {
      root: null_mut(),
      _adapter: PhantomData,
    }
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.root.is_null()
  }

  pub(crate) fn first(&self) -> *mut A::Node {
    if self.root.is_null() {
      return null_mut();
    }
    Self::minimum(self.root)
  }

  pub(crate) fn last(&self) -> *mut A::Node {
    let mut cur = self.root;
    if cur.is_null() {
      return cur;
    }
    while !right::<A>(cur).is_null() {
      cur = right::<A>(cur);
    }
    cur
  }

  /// In-order successor.
  pub(crate) fn next(&self, node: *mut A::Node) -> *mut A::Node {
    let r = right::<A>(node);
    if !r.is_null() {
      return Self::minimum(r);
    }
    let mut cur = node;
    let mut p = parent::<A>(cur);
    while !p.is_null() && cur == right::<A>(p) {
      cur = p;
      p = parent::<A>(p);
    }
    p
  }

  /// In-order predecessor.
  pub(crate) fn prev(&self, node: *mut A::Node) -> *mut A::Node {
    let l = left::<A>(node);
    if !l.is_null() {
      let mut cur = l;
      while !right::<A>(cur).is_null() {
        cur = right::<A>(cur);
      }
      return cur;
    }
    let mut cur = node;
    let mut p = parent::<A>(cur);
    while !p.is_null() && cur == left::<A>(p) {
      cur = p;
      p = parent::<A>(p);
    }
    p
  }

  /// Finds the node for which `cmp` returns `Equal`. `cmp` orders the search
  /// key against the node it is given.
  pub(crate) fn search_by(&self, cmp: impl Fn(*mut A::Node) -> Ordering) -> *mut A::Node {
    let mut cur = self.root;
    while !cur.is_null() {
      match cmp(cur) {
        Ordering::Less => cur = left::<A>(cur),
        Ordering::Greater => cur = right::<A>(cur),
        Ordering::Equal => return cur,
      }
    }
    null_mut()
  }

  /// Finds the node equal to the key, or else the smallest node above it.
  pub(crate) fn search_or_next_by(
    &self,
    cmp: impl Fn(*mut A::Node) -> Ordering,
  ) -> *mut A::Node {
    let mut cur = self.root;
    let mut ret = null_mut();
    while !cur.is_null() {
      match cmp(cur) {
        Ordering::Less => {
          ret = cur;
          cur = left::<A>(cur);
        }
        Ordering::Greater => cur = right::<A>(cur),
        Ordering::Equal => return cur,
      }
    }
    ret
  }

  /// True if `node` itself is in the tree.
  pub(crate) fn contains(&self, node: *mut A::Node) -> bool {
    self.search_by(|n| A::compare(node, n)) == node
  }

  pub(crate) unsafe fn insert(&mut self, node: *mut A::Node) {
    let mut p = null_mut();
    let mut cur = self.root;
    let mut went_left = false;
    while !cur.is_null() {
      p = cur;
      let ord = A::compare(node, cur);
      debug_assert!(ord != Ordering::Equal, "duplicate node in red-black tree");
      went_left = ord == Ordering::Less;
      cur = if went_left { left::<A>(cur) } else { right::<A>(cur) };
    }

    let l = link::<A>(node);
    l.left = null_mut();
    l.right = null_mut();
    l.parent = p;
    l.red = true;

    if p.is_null() {
      self.root = node;
    } else if went_left {
      link::<A>(p).left = node;
    } else {
      link::<A>(p).right = node;
    }
    self.insert_fixup(node);
  }

  pub(crate) unsafe fn remove(&mut self, z: *mut A::Node) {
    debug_assert!(self.contains(z), "removing a node that is not in the tree");
    let mut y = z;
    let mut y_was_red = is_red::<A>(y);
    let x;
    let x_parent;

    if left::<A>(z).is_null() {
      x = right::<A>(z);
      x_parent = parent::<A>(z);
      self.transplant(z, x);
    } else if right::<A>(z).is_null() {
      x = left::<A>(z);
      x_parent = parent::<A>(z);
      self.transplant(z, x);
    } else {
      y = Self::minimum(right::<A>(z));
      y_was_red = is_red::<A>(y);
      x = right::<A>(y);
      if parent::<A>(y) == z {
        x_parent = y;
      } else {
        x_parent = parent::<A>(y);
        self.transplant(y, x);
        let zr = right::<A>(z);
        link::<A>(y).right = zr;
        link::<A>(zr).parent = y;
      }
      self.transplant(z, y);
      let zl = left::<A>(z);
      link::<A>(y).left = zl;
      link::<A>(zl).parent = y;
      set_red::<A>(y, is_red::<A>(z));
    }

    if !y_was_red {
      self.remove_fixup(x, x_parent);
    }

    let l = link::<A>(z);
    l.left = null_mut();
    l.right = null_mut();
    l.parent = null_mut();
    l.red = false;
  }

  pub(crate) fn iter(&self) -> RbIter<'_, A> {
    RbIter {
      tree: self,
      cur: self.first(),
    }
  }

  fn minimum(mut n: *mut A::Node) -> *mut A::Node {
    while !left::<A>(n).is_null() {
      n = left::<A>(n);
    }
    n
  }

  fn transplant(&mut self, u: *mut A::Node, v: *mut A::Node) {
    let up = parent::<A>(u);
    if up.is_null() {
      self.root = v;
    } else if u == left::<A>(up) {
      link::<A>(up).left = v;
    } else {
      link::<A>(up).right = v;
    }
    if !v.is_null() {
      link::<A>(v).parent = up;
    }
  }

  fn rotate_left(&mut self, x: *mut A::Node) {
    let y = right::<A>(x);
    let yl = left::<A>(y);
    link::<A>(x).right = yl;
    if !yl.is_null() {
      link::<A>(yl).parent = x;
    }
    self.transplant(x, y);
    link::<A>(y).left = x;
    link::<A>(x).parent = y;
  }

  fn rotate_right(&mut self, x: *mut A::Node) {
    let y = left::<A>(x);
    let yr = right::<A>(y);
    link::<A>(x).left = yr;
    if !yr.is_null() {
      link::<A>(yr).parent = x;
    }
    self.transplant(x, y);
    link::<A>(y).right = x;
    link::<A>(x).parent = y;
  }

  fn insert_fixup(&mut self, mut z: *mut A::Node) {
    while is_red::<A>(parent::<A>(z)) {
      let p = parent::<A>(z);
      let g = parent::<A>(p);
      if p == left::<A>(g) {
        let uncle = right::<A>(g);
        if is_red::<A>(uncle) {
          set_red::<A>(p, false);
          set_red::<A>(uncle, false);
          set_red::<A>(g, true);
          z = g;
        } else {
          if z == right::<A>(p) {
            z = p;
            self.rotate_left(z);
          }
          let p = parent::<A>(z);
          let g = parent::<A>(p);
          set_red::<A>(p, false);
          set_red::<A>(g, true);
          self.rotate_right(g);
        }
      } else {
        let uncle = left::<A>(g);
        if is_red::<A>(uncle) {
          set_red::<A>(p, false);
          set_red::<A>(uncle, false);
          set_red::<A>(g, true);
          z = g;
        } else {
          if z == left::<A>(p) {
            z = p;
            self.rotate_right(z);
          }
          let p = parent::<A>(z);
          let g = parent::<A>(p);
          set_red::<A>(p, false);
          set_red::<A>(g, true);
          self.rotate_left(g);
        }
      }
    }
    set_red::<A>(self.root, false);
  }

  fn remove_fixup(&mut self, mut x: *mut A::Node, mut xp: *mut A::Node) {
    while x != self.root && !is_red::<A>(x) {
      if x == left::<A>(xp) {
        let mut w = right::<A>(xp);
        if is_red::<A>(w) {
          set_red::<A>(w, false);
          set_red::<A>(xp, true);
          self.rotate_left(xp);
          w = right::<A>(xp);
        }
        if !is_red::<A>(left::<A>(w)) && !is_red::<A>(right::<A>(w)) {
          set_red::<A>(w, true);
          x = xp;
          xp = parent::<A>(x);
        } else {
          if !is_red::<A>(right::<A>(w)) {
            set_red::<A>(left::<A>(w), false);
            set_red::<A>(w, true);
            self.rotate_right(w);
            w = right::<A>(xp);
          }
          set_red::<A>(w, is_red::<A>(xp));
          set_red::<A>(xp, false);
          set_red::<A>(right::<A>(w), false);
          self.rotate_left(xp);
          x = self.root;
          xp = null_mut();
        }
      } else {
        let mut w = left::<A>(xp);
        if is_red::<A>(w) {
          set_red::<A>(w, false);
          set_red::<A>(xp, true);
          self.rotate_right(xp);
          w = left::<A>(xp);
        }
        if !is_red::<A>(right::<A>(w)) && !is_red::<A>(left::<A>(w)) {
          set_red::<A>(w, true);
          x = xp;
          xp = parent::<A>(x);
        } else {
          if !is_red::<A>(left::<A>(w)) {
            set_red::<A>(right::<A>(w), false);
            set_red::<A>(w, true);
            self.rotate_left(w);
            w = left::<A>(xp);
          }
          set_red::<A>(w, is_red::<A>(xp));
          set_red::<A>(xp, false);
          set_red::<A>(left::<A>(w), false);
          self.rotate_right(xp);
          x = self.root;
          xp = null_mut();
        }
      }
    }
    if !x.is_null() {
      set_red::<A>(x, false);
    }
  }

  /// Checks ordering, parent links and red-black invariants. Returns the
  /// black height.
  #[cfg(test)]
  pub(crate) fn check(&self) -> usize {
    fn walk<A: RbAdapter>(n: *mut A::Node, p: *mut A::Node) -> usize {
      if n.is_null() {
        return 1;
      }
      assert!(parent::<A>(n) == p, "broken parent link");
      if is_red::<A>(n) {
        assert!(!is_red::<A>(left::<A>(n)) && !is_red::<A>(right::<A>(n)), "red node with red child");
      }
      let l = left::<A>(n);
      let r = right::<A>(n);
      if !l.is_null() {
        assert_eq!(A::compare(l, n), Ordering::Less);
      }
      if !r.is_null() {
        assert_eq!(A::compare(r, n), Ordering::Greater);
      }
      let lh = walk::<A>(l, n);
      let rh = walk::<A>(r, n);
      assert_eq!(lh, rh, "unbalanced black height");
      lh + usize::from(!is_red::<A>(n))
    }
    assert!(!is_red::<A>(self.root));
    walk::<A>(self.root, null_mut())
  }
}

pub(crate) struct RbIter<'a, A: RbAdapter> {
  tree: &'a RbTree<A>,
  cur: *mut A::Node,
}

impl<A: RbAdapter> Iterator for RbIter<'_, A> {
  type Item = *mut A::Node;

  fn next(&mut self) -> Option<Self::Item> {
    if self.cur.is_null() {
      return None;
    }
    let node = self.cur;
    self.cur = self.tree.next(node);
    Some(node)
  }
}
