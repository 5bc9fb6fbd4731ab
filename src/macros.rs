#![allow(unused_macros)]

/// Acquires an engine mutex, treating poisoning as engine-state corruption.
///
/// A poisoned lock means a thread panicked inside a critical section of the
/// engine (a synchall window, a wrap-stack mutation, an allocation), after
/// which no invariant can be trusted; paths that can report instead of
/// aborting go through [`crate::Error::LockError`] rather than this macro.
///
/// ```rust, ignore
///  lock!(self.pending).push_back(record);
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock
            .lock()
            .expect("engine mutex poisoned by a panicked critical section")
    };
}

/// Takes the reader side of an engine `RwLock` (cache-unit bytes, slab
/// slots, mapped regions), with the same poisoning-is-corruption stance as
/// [`lock!`].
///
/// ```rust, ignore
///  let code = read_lock!(self.code);
///  buf.copy_from_slice(&code[offset..offset + n]);
/// ```
macro_rules! read_lock {
    ($rwlock:expr) => {
        $rwlock
            .read()
            .expect("engine rwlock poisoned on the reader side")
    };
}

/// Takes the writer side of an engine `RwLock`; held only for the short
/// exclusive sections the lock rank allows.
///
/// ```rust, ignore
///  write_lock!(self.code).extend_from_slice(bytes);
/// ```
macro_rules! write_lock {
    ($rwlock:expr) => {
        $rwlock
            .write()
            .expect("engine rwlock poisoned on the writer side")
    };
}
