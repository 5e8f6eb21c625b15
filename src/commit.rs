//! Stage, verify, then flip a single pointer.
//!
//! Both the binary update and the data relocation follow the same rule: the
//! new state is built and checked in full before one pointer makes it live,
//! and the old state is never destroyed by the same operation. The type state
//! below makes "commit without verify" unrepresentable.

/// Something that decides which staged state is live.
pub trait CommitPointer<S: ?Sized> {
    type Error;

    /// Make `staged` the live state. Must leave the previous state intact on error.
    fn flip(&self, staged: &S) -> Result<(), Self::Error>;
}

/// A candidate state that has not been checked yet.
#[derive(Debug)]
pub struct Staged<S> {
    state: S,
}

/// A candidate state that passed verification and may be committed.
#[derive(Debug)]
pub struct Verified<S> {
    state: S,
}

impl<S> Staged<S> {
    pub fn new(state: S) -> Self {
        Self { state }
    }

    /// Run `check` against the staged state. On failure the state is dropped
    /// from the commit path; whatever it refers to on disk is left alone.
    pub fn verify<E>(self, check: impl FnOnce(&S) -> Result<(), E>) -> Result<Verified<S>, E> {
        check(&self.state)?;
        Ok(Verified { state: self.state })
    }
}

impl<S> Verified<S> {
    /// Flip `pointer` to this state, returning the state on success.
    pub fn commit<P>(self, pointer: &P) -> Result<S, P::Error>
    where
        P: CommitPointer<S> + ?Sized,
    {
        pointer.flip(&self.state)?;
        Ok(self.state)
    }
}
