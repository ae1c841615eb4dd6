//! trame-threads — poignées de threads OS à résultat typé
//!
//! Un [`Thread<T>`] possède le thread OS sous-jacent : `join` transfère la
//! valeur de retour exactement une fois (imposé par les signatures
//! consommantes, pas par un drapeau), et l'abandon de la poignée détache le
//! thread. L'état capturé voyage par valeur dans la fermeture.
//!
//! Exemple rapide :
//! ```
//! use trame_threads::{spawn, join_all};
//!
//! let h = spawn(|| 21 * 2);
//! assert_eq!(h.join(), 42);
//!
//! let hs: Vec<_> = (0..4).map(|i| spawn(move || i + 1)).collect();
//! let total: i32 = join_all(hs).into_iter().map(Result::unwrap).sum();
//! assert_eq!(total, 10);
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

use std::any::Any;
use std::thread;

use thiserror::Error;

/// Échec d'un `join` : le thread a paniqué.
#[derive(Debug, Error)]
#[error("thread panicked: {message}")]
pub struct JoinError {
    message: String,
}

impl JoinError {
    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic payload of unknown type".to_owned());
        JoinError { message }
    }

    /// Message de panique capturé, si disponible.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Poignée d'un thread OS dont la valeur de retour est de type `T`.
///
/// Abandonner la poignée sans `join` détache le thread.
#[must_use = "dropping a Thread detaches it"]
pub struct Thread<T> {
    handle: thread::JoinHandle<T>,
}

/// Lance un thread OS exécutant `f`.
pub fn spawn<F, T>(f: F) -> Thread<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Thread { handle: thread::spawn(f) }
}

impl<T> Thread<T> {
    /// Attend la fin du thread et transfère sa valeur de retour.
    ///
    /// # Panics
    /// Relaye la panique du thread joint, comme `std::thread`.
    pub fn join(self) -> T {
        match self.handle.join() {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Variante de [`Thread::join`] qui rapporte la panique du thread au
    /// lieu de la relayer. Pour les chemins de reprise.
    pub fn try_join(self) -> Result<T, JoinError> {
        self.handle.join().map_err(JoinError::from_panic)
    }

    /// Le thread a-t-il terminé ? Ne bloque pas.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Joint une collection de poignées, dans l'ordre.
pub fn join_all<T>(handles: Vec<Thread<T>>) -> Vec<Result<T, JoinError>> {
    handles.into_iter().map(Thread::try_join).collect()
}
