#![deny(missing_docs)]
//! trame-parallel — pool de travailleurs et pont d'itérateur parallèle
//!
//! Fournit :
//! - [`ThreadPool`]: N travailleurs fixes tirant leurs tâches d'un canal
//!   borné unique; fermeture puis jonction déterministes.
//! - [`ParConfig`]: taille des morceaux et fenêtre de tâches en vol.
//! - [`par_each`], [`par_map_collect_unordered`],
//!   [`par_filter_collect_unordered`]: adaptation d'une séquence paresseuse
//!   mono-thread en travail parallèle par morceaux, avec contre-pression par
//!   jetons.
//!
//! La séquence source est tirée sur le thread appelant; seuls les morceaux
//! traversent vers le pool. L'ordre des sorties est l'ordre d'achèvement des
//! morceaux, jamais celui de la séquence.

#![forbid(unsafe_code)]

use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;
use trame_channel::mpsc::{self, Receiver, Sender};
use trame_threads::{spawn, Thread};

// ===========================================================================
// Pool de travailleurs
// ===========================================================================

/// Erreurs du pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Soumission sur un pool fermé.
    #[error("pool is closed")]
    Closed,
}

/// Tâche opaque exécutée par un travailleur.
type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    sender: Option<Sender<Job>>,
    workers: Vec<Thread<()>>,
}

struct PoolInner {
    size: usize,
    state: Mutex<PoolState>,
}

/// Pool de travailleurs de taille fixe partageant une file de tâches bornée.
///
/// La poignée se clone; chaque clone garde le pool en vie. La dernière
/// poignée abandonnée ferme la file et joint les travailleurs.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Crée un pool de `size` travailleurs avec une file de capacité
    /// `queue_capacity`.
    ///
    /// # Panics
    /// Si `size == 0`, si `queue_capacity == 0` ou si l'allocation de la
    /// file échoue.
    #[must_use]
    pub fn new(size: usize, queue_capacity: usize) -> Self {
        assert!(size > 0, "pool needs at least one worker");
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity);
        let workers = (0..size)
            .map(|id| {
                let rx = rx.clone();
                spawn(move || {
                    trace!("worker {id}: started");
                    while let Some(job) = rx.recv() {
                        job();
                    }
                    trace!("worker {id}: end of stream");
                })
            })
            .collect();
        // Le `rx` d'origine part ici: seuls les clones des travailleurs restent.
        ThreadPool {
            inner: Arc::new(PoolInner {
                size,
                state: Mutex::new(PoolState { sender: Some(tx), workers }),
            }),
        }
    }

    /// Pool dimensionné sur le nombre de cœurs logiques.
    #[must_use]
    pub fn with_num_cpus(queue_capacity: usize) -> Self {
        Self::new(num_cpus::get().max(1), queue_capacity)
    }

    /// Nombre de travailleurs.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Soumet une tâche. Bloque si la file est pleine; `false` si le pool
    /// est fermé.
    pub fn submit<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_submit(f).is_ok()
    }

    /// Jumeau typé de [`ThreadPool::submit`]. Bloque de la même manière sur
    /// une file pleine.
    pub fn try_submit<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        // Cloner l'émetteur hors du verrou: `send` peut bloquer longtemps.
        let tx = self
            .inner
            .state
            .lock()
            .sender
            .clone()
            .ok_or(PoolError::Closed)?;
        if tx.send(Box::new(f)) {
            Ok(())
        } else {
            Err(PoolError::Closed)
        }
    }

    /// Soumet `f` et retourne le receveur mono-coup de son résultat.
    ///
    /// Si le pool est fermé, la tâche ne court jamais et le receveur livre
    /// immédiatement `None`.
    #[must_use]
    pub fn submit_with_result<T, F>(&self, f: F) -> Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<T>(1);
        let _ = self.submit(move || {
            let _ = tx.send(f());
        });
        rx
    }

    /// Ferme la file (idempotent): les soumissions échouent désormais, les
    /// tâches déjà en file courent jusqu'au bout et les travailleurs voient
    /// la fin de flux.
    pub fn close(&self) {
        let dropped = self.inner.state.lock().sender.take();
        if dropped.is_some() {
            debug!("pool: queue closed");
        }
    }

    /// Joint tous les travailleurs. À faire précéder de
    /// [`ThreadPool::close`], sans quoi les travailleurs attendent encore
    /// des tâches.
    pub fn join(&self) {
        let workers = {
            let mut st = self.inner.state.lock();
            std::mem::take(&mut st.workers)
        };
        for worker in workers {
            if let Err(err) = worker.try_join() {
                warn!("pool: worker panicked: {err}");
            }
        }
    }

    /// Fermeture puis jonction (idempotent).
    pub fn shutdown(&self) {
        self.close();
        self.join();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Dernière poignée: fermer la file et joindre ce qui reste.
        let st = self.state.get_mut();
        st.sender = None;
        for worker in st.workers.drain(..) {
            if let Err(err) = worker.try_join() {
                warn!("pool: worker panicked: {err}");
            }
        }
    }
}

// ===========================================================================
// Configuration du pont parallèle
// ===========================================================================

/// Taille de morceau par défaut quand la séquence ne donne aucun indice.
const DEFAULT_CHUNK: usize = 64;

/// Réglage du pont parallèle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParConfig {
    /// Nombre d'éléments tirés de la séquence par tâche.
    pub chunk_size: usize,
    /// Nombre maximal de tâches simultanément en vol.
    pub max_in_flight: usize,
}

impl ParConfig {
    /// Construit une configuration; les deux champs sont ramenés à au
    /// moins 1.
    #[must_use]
    pub fn new(chunk_size: usize, max_in_flight: usize) -> Self {
        ParConfig {
            chunk_size: chunk_size.max(1),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Valeurs par défaut pour `pool`: morceaux de 64, fenêtre
    /// `2 × taille du pool`.
    #[must_use]
    pub fn default_for(pool: &ThreadPool) -> Self {
        ParConfig::new(DEFAULT_CHUNK, pool.size() * 2)
    }

    /// Variante informée du nombre total d'éléments attendu: vise quatre
    /// morceaux par travailleur.
    #[must_use]
    pub fn with_hint(pool: &ThreadPool, total: usize) -> Self {
        ParConfig::new(total / (4 * pool.size()), pool.size() * 2)
    }
}

// ===========================================================================
// Pont d'itérateur parallèle
// ===========================================================================

/// Rend le jeton de vol à la fin de la tâche, panique comprise.
struct PermitGuard {
    tx: Sender<()>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        // Le canal de jetons ne déborde jamais: un jeton consommé par
        // soumission, un rendu par tâche.
        let _ = self.tx.send(());
    }
}

/// Applique `f` à chaque élément de `it`, par morceaux sur `pool`.
///
/// La contre-pression est un canal de jetons de capacité
/// `cfg.max_in_flight`, préchargé; chaque tâche rend son jeton en terminant.
/// Retourne `true` si tous les morceaux ont pu être soumis, `false` si le
/// pool a fermé en cours de route.
pub fn par_each<I, F>(it: I, pool: &ThreadPool, cfg: ParConfig, f: F) -> bool
where
    I: IntoIterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let (permit_tx, permit_rx) = mpsc::channel::<()>(cfg.max_in_flight);
    for _ in 0..cfg.max_in_flight {
        let _ = permit_tx.send(());
    }
    let mut it = it.into_iter();
    loop {
        let chunk: Vec<I::Item> = it.by_ref().take(cfg.chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        // Un jeton par morceau en vol.
        if permit_rx.recv().is_none() {
            return false;
        }
        let f = Arc::clone(&f);
        let permit = PermitGuard { tx: permit_tx.clone() };
        let submitted = pool.submit(move || {
            let _permit = permit;
            for item in chunk {
                f(item);
            }
        });
        if !submitted {
            return false;
        }
    }
    // Récupérer tous les jetons: plus rien en vol.
    for _ in 0..cfg.max_in_flight {
        let _ = permit_rx.recv();
    }
    true
}

/// Moteur commun des ponts à collecte: morceaux tirés sur le thread
/// appelant, jetons de vol, un canal de résultat mono-coup par tâche.
fn run_chunked<I, U, G>(it: I, pool: &ThreadPool, cfg: ParConfig, g: G) -> Option<Vec<U>>
where
    I: IntoIterator,
    I::Item: Send + 'static,
    U: Send + 'static,
    G: Fn(Vec<I::Item>) -> Vec<U> + Send + Sync + 'static,
{
    let g = Arc::new(g);
    let (permit_tx, permit_rx) = mpsc::channel::<()>(cfg.max_in_flight);
    for _ in 0..cfg.max_in_flight {
        let _ = permit_tx.send(());
    }
    let mut results: Vec<Receiver<Vec<U>>> = Vec::new();
    let mut it = it.into_iter();
    loop {
        let chunk: Vec<I::Item> = it.by_ref().take(cfg.chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        if permit_rx.recv().is_none() {
            return None;
        }
        let g = Arc::clone(&g);
        let permit = PermitGuard { tx: permit_tx.clone() };
        let (out_tx, out_rx) = mpsc::channel::<Vec<U>>(1);
        let submitted = pool.submit(move || {
            let _permit = permit;
            let out = g(chunk);
            let _ = out_tx.send(out);
        });
        if !submitted {
            return None;
        }
        results.push(out_rx);
    }
    let mut collected = Vec::new();
    for rx in results {
        if let Some(mut out) = rx.recv() {
            collected.append(&mut out);
        }
    }
    Some(collected)
}

/// Transforme `it` par morceaux sur `pool` et concatène les sorties, dans
/// l'ordre d'achèvement des morceaux.
///
/// `None` si le pool a fermé avant la fin des soumissions.
#[must_use]
pub fn par_map_collect_unordered<I, U, F>(
    it: I,
    pool: &ThreadPool,
    cfg: ParConfig,
    f: F,
) -> Option<Vec<U>>
where
    I: IntoIterator,
    I::Item: Send + 'static,
    U: Send + 'static,
    F: Fn(I::Item) -> U + Send + Sync + 'static,
{
    run_chunked(it, pool, cfg, move |chunk| {
        chunk.into_iter().map(|item| f(item)).collect()
    })
}

/// Filtre `it` par morceaux sur `pool` et concatène les éléments retenus,
/// dans l'ordre d'achèvement des morceaux.
///
/// `None` si le pool a fermé avant la fin des soumissions.
#[must_use]
pub fn par_filter_collect_unordered<I, P>(
    it: I,
    pool: &ThreadPool,
    cfg: ParConfig,
    pred: P,
) -> Option<Vec<I::Item>>
where
    I: IntoIterator,
    I::Item: Send + 'static,
    P: Fn(&I::Item) -> bool + Send + Sync + 'static,
{
    run_chunked(it, pool, cfg, move |chunk| {
        chunk.into_iter().filter(|item| pred(item)).collect()
    })
}

// ===========================================================================
// Tests
// ===========================================================================
