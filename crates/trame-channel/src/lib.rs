//! trame-channel — canaux bornés pour le multithreading sans partage
//!
//! Couvre :
//! - MPSC: file FIFO bornée (anneau + mutex + deux condvars), comptage
//!   explicite des extrémités, fermeture monotone.
//! - Broadcast: fan-out best-effort, un canal interne borné par abonné
//!   (perte silencieuse si l'abonné est plein).
//! - [`recv_any`]: select minimal par scrutation sur plusieurs receveurs.
//!
//! La durée de vie d'un canal est déterminée uniquement par ses compteurs
//! d'extrémités, tenus sous le mutex du canal : dernier `Sender` parti →
//! canal fermé ; dernier `Receiver` parti → canal fermé et tampon vidé ;
//! dernière extrémité, toutes catégories confondues → destruction.

#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

// ===========================================================================
// Erreurs
// ===========================================================================

/// Erreurs de construction d'un canal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Capacité nulle là où au moins 1 est requis.
    #[error("capacity must be at least 1")]
    Capacity,
    /// L'allocation du tampon a échoué.
    #[error("allocation of {slots} slots failed")]
    Alloc {
        /// Nombre d'emplacements demandés.
        slots: usize,
    },
}

// ===========================================================================
// MPSC borné
// ===========================================================================

pub mod mpsc {
    use super::*;

    /// Tampon circulaire borné. La queue est dérivée: `(head + len) % cap`.
    struct Ring<T> {
        slots: Box<[Option<T>]>,
        head: usize,
        len: usize,
    }

    impl<T> Ring<T> {
        fn with_capacity(cap: usize) -> Result<Self, ChannelError> {
            if cap == 0 {
                return Err(ChannelError::Capacity);
            }
            let mut slots = Vec::new();
            slots
                .try_reserve_exact(cap)
                .map_err(|_| ChannelError::Alloc { slots: cap })?;
            slots.extend((0..cap).map(|_| None));
            Ok(Ring { slots: slots.into_boxed_slice(), head: 0, len: 0 })
        }

        fn is_full(&self) -> bool {
            self.len == self.slots.len()
        }

        fn push(&mut self, value: T) {
            debug_assert!(!self.is_full());
            let tail = (self.head + self.len) % self.slots.len();
            self.slots[tail] = Some(value);
            self.len += 1;
        }

        fn pop(&mut self) -> Option<T> {
            if self.len == 0 {
                return None;
            }
            let value = self.slots[self.head].take();
            debug_assert!(value.is_some());
            self.head = (self.head + 1) % self.slots.len();
            self.len -= 1;
            value
        }

        fn clear(&mut self) {
            while self.pop().is_some() {}
        }
    }

    /// État du canal, intégralement sous mutex.
    struct State<T> {
        ring: Ring<T>,
        closed: bool,
        senders: usize,
        receivers: usize,
    }

    struct Shared<T> {
        state: Mutex<State<T>>,
        /// Réveillée quand un emplacement se libère ou que le canal ferme.
        can_send: Condvar,
        /// Réveillée quand un message arrive ou que le canal ferme.
        can_recv: Condvar,
    }

    impl<T> Shared<T> {
        /// Fermeture monotone: réveille tout le monde, ne vide pas le tampon.
        fn close(&self) {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            drop(st);
            self.can_send.notify_all();
            self.can_recv.notify_all();
        }
    }

    /// Extrémité émettrice d'un canal borné.
    pub struct Sender<T> {
        shared: Arc<Shared<T>>,
    }

    /// Extrémité réceptrice d'un canal borné.
    pub struct Receiver<T> {
        shared: Arc<Shared<T>>,
    }

    /// Crée un canal borné de capacité `capacity`, avec une extrémité de
    /// chaque sorte.
    ///
    /// # Panics
    /// Si `capacity == 0` ou si l'allocation du tampon échoue.
    #[must_use]
    pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
        match try_channel(capacity) {
            Ok(pair) => pair,
            Err(err) => panic!("channel({capacity}): {err}"),
        }
    }

    /// Variante faillible de [`channel`].
    pub fn try_channel<T>(capacity: usize) -> Result<(Sender<T>, Receiver<T>), ChannelError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                ring: Ring::with_capacity(capacity)?,
                closed: false,
                senders: 1,
                receivers: 1,
            }),
            can_send: Condvar::new(),
            can_recv: Condvar::new(),
        });
        Ok((Sender { shared: Arc::clone(&shared) }, Receiver { shared }))
    }

    impl<T> Sender<T> {
        /// Envoi bloquant: attend qu'un emplacement se libère.
        ///
        /// Retourne `false` (et libère `msg`) si le canal est fermé ou si
        /// tous les receveurs ont disparu.
        pub fn send(&self, msg: T) -> bool {
            let mut st = self.shared.state.lock();
            while !st.closed && st.receivers > 0 && st.ring.is_full() {
                self.shared.can_send.wait(&mut st);
            }
            if st.closed || st.receivers == 0 {
                return false;
            }
            st.ring.push(msg);
            drop(st);
            self.shared.can_recv.notify_one();
            true
        }

        /// Envoi non bloquant: `false` si fermé, sans receveur ou plein.
        pub fn try_send(&self, msg: T) -> bool {
            let mut st = self.shared.state.lock();
            if st.closed || st.receivers == 0 || st.ring.is_full() {
                return false;
            }
            st.ring.push(msg);
            drop(st);
            self.shared.can_recv.notify_one();
            true
        }

        /// Ferme le canal (idempotent). Les messages en attente restent
        /// lisibles côté réception.
        pub fn close(&self) {
            self.shared.close();
        }

        /// Le canal est-il fermé ?
        #[must_use]
        pub fn is_closed(&self) -> bool {
            self.shared.state.lock().closed
        }
    }

    impl<T> Clone for Sender<T> {
        fn clone(&self) -> Self {
            self.shared.state.lock().senders += 1;
            Sender { shared: Arc::clone(&self.shared) }
        }
    }

    impl<T> Drop for Sender<T> {
        fn drop(&mut self) {
            let mut st = self.shared.state.lock();
            st.senders -= 1;
            if st.senders == 0 {
                st.closed = true;
                drop(st);
                self.shared.can_send.notify_all();
                self.shared.can_recv.notify_all();
            }
        }
    }

    impl<T> Receiver<T> {
        /// Réception bloquante. `None` une fois le canal fermé et vidé.
        pub fn recv(&self) -> Option<T> {
            let mut st = self.shared.state.lock();
            loop {
                if let Some(msg) = st.ring.pop() {
                    drop(st);
                    self.shared.can_send.notify_one();
                    return Some(msg);
                }
                if st.closed {
                    return None;
                }
                self.shared.can_recv.wait(&mut st);
            }
        }

        /// Réception non bloquante. Livre les messages restants même si le
        /// canal est fermé.
        pub fn try_recv(&self) -> Option<T> {
            let mut st = self.shared.state.lock();
            let msg = st.ring.pop()?;
            drop(st);
            self.shared.can_send.notify_one();
            Some(msg)
        }

        /// Nombre de messages en attente (instantané, sans garantie).
        #[must_use]
        pub fn len(&self) -> usize {
            self.shared.state.lock().ring.len
        }

        /// Le tampon est-il vide (instantané) ?
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Le canal est-il fermé ?
        #[must_use]
        pub fn is_closed(&self) -> bool {
            self.shared.state.lock().closed
        }

        /// Ferme le canal (idempotent). Les messages en attente restent
        /// lisibles via [`Receiver::try_recv`]; seul le départ du dernier
        /// receveur les libère.
        pub fn close(&self) {
            self.shared.close();
        }
    }

    impl<T> Clone for Receiver<T> {
        fn clone(&self) -> Self {
            self.shared.state.lock().receivers += 1;
            Receiver { shared: Arc::clone(&self.shared) }
        }
    }

    impl<T> Drop for Receiver<T> {
        fn drop(&mut self) {
            let mut st = self.shared.state.lock();
            st.receivers -= 1;
            if st.receivers == 0 {
                // Plus personne pour consommer: fermer et libérer tout de suite.
                st.closed = true;
                st.ring.clear();
                drop(st);
                self.shared.can_send.notify_all();
                self.shared.can_recv.notify_all();
            }
        }
    }
}

// ===========================================================================
// Broadcast (fan-out best-effort)
// ===========================================================================

pub mod broadcast {
    use super::*;
    use crate::mpsc;

    struct State<T> {
        /// Extrémité émettrice du canal privé de chaque abonné.
        subscribers: Vec<mpsc::Sender<T>>,
        closed: bool,
        /// Poignées publicatrices vivantes.
        publishers: usize,
    }

    struct Shared<T> {
        capacity: usize,
        state: Mutex<State<T>>,
    }

    /// Poignée publicatrice d'une diffusion best-effort.
    pub struct BroadcastSender<T: Clone> {
        shared: Arc<Shared<T>>,
    }

    /// Crée une diffusion dont chaque abonné reçoit via un canal borné de
    /// capacité `capacity`.
    ///
    /// # Panics
    /// Si `capacity == 0`.
    #[must_use]
    pub fn broadcast<T: Clone>(capacity: usize) -> BroadcastSender<T> {
        match try_broadcast(capacity) {
            Ok(tx) => tx,
            Err(err) => panic!("broadcast({capacity}): {err}"),
        }
    }

    /// Variante faillible de [`broadcast`].
    pub fn try_broadcast<T: Clone>(capacity: usize) -> Result<BroadcastSender<T>, ChannelError> {
        if capacity == 0 {
            return Err(ChannelError::Capacity);
        }
        Ok(BroadcastSender {
            shared: Arc::new(Shared {
                capacity,
                state: Mutex::new(State {
                    subscribers: Vec::new(),
                    closed: false,
                    publishers: 1,
                }),
            }),
        })
    }

    impl<T: Clone> BroadcastSender<T> {
        /// Enregistre un abonné et retourne son receveur privé.
        ///
        /// Sur une diffusion fermée, le receveur rendu est déjà fermé et
        /// livre immédiatement `None`.
        #[must_use]
        pub fn subscribe(&self) -> mpsc::Receiver<T> {
            let (tx, rx) = mpsc::channel(self.shared.capacity);
            let mut st = self.shared.state.lock();
            if !st.closed {
                st.subscribers.push(tx);
            }
            rx
        }

        /// Publie `msg` vers chaque abonné (une copie par abonné, `try_send`):
        /// un abonné plein perd le message, un abonné parti est retiré de la
        /// liste. Retourne le nombre de livraisons réussies; 0 si fermé.
        pub fn send(&self, msg: T) -> usize {
            let mut st = self.shared.state.lock();
            if st.closed {
                return 0;
            }
            let mut delivered = 0;
            st.subscribers.retain(|tx| {
                if tx.is_closed() {
                    return false;
                }
                if tx.try_send(msg.clone()) {
                    delivered += 1;
                }
                true
            });
            delivered
        }

        /// Ferme la diffusion (idempotent): la liste d'abonnés est vidée et
        /// chaque canal interne perd son émetteur, donc se ferme après
        /// vidage côté abonné.
        pub fn close(&self) {
            let mut st = self.shared.state.lock();
            if !st.closed {
                st.closed = true;
                st.subscribers.clear();
            }
        }

        /// La diffusion est-elle fermée ?
        #[must_use]
        pub fn is_closed(&self) -> bool {
            self.shared.state.lock().closed
        }

        /// Nombre d'abonnés encore enregistrés.
        #[must_use]
        pub fn subscriber_count(&self) -> usize {
            self.shared.state.lock().subscribers.len()
        }
    }

    impl<T: Clone> Clone for BroadcastSender<T> {
        fn clone(&self) -> Self {
            self.shared.state.lock().publishers += 1;
            BroadcastSender { shared: Arc::clone(&self.shared) }
        }
    }

    impl<T: Clone> Drop for BroadcastSender<T> {
        fn drop(&mut self) {
            let mut st = self.shared.state.lock();
            st.publishers -= 1;
            if st.publishers == 0 && !st.closed {
                st.closed = true;
                st.subscribers.clear();
            }
        }
    }
}

// ===========================================================================
// Select minimal
// ===========================================================================

/// Scrutation sur plusieurs receveurs: renvoie le premier message disponible
/// avec l'indice de son canal, ou `None` quand tous sont fermés et vidés.
pub fn recv_any<T>(receivers: &[mpsc::Receiver<T>]) -> Option<(usize, T)> {
    if receivers.is_empty() {
        return None;
    }
    loop {
        for (i, rx) in receivers.iter().enumerate() {
            if let Some(msg) = rx.try_recv() {
                return Some((i, msg));
            }
        }
        if receivers.iter().all(|rx| rx.is_closed() && rx.is_empty()) {
            return None;
        }
        std::thread::yield_now();
    }
}

pub use broadcast::{broadcast, try_broadcast, BroadcastSender};
pub use mpsc::{channel, try_channel, Receiver, Sender};

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn mpsc_basic() {
        let (tx, rx) = mpsc::channel(4);
        assert!(tx.send(1));
        assert_eq!(rx.recv(), Some(1));
    }

    #[test]
    fn mpsc_fifo_single_producer() {
        let (tx, rx) = mpsc::channel(8);
        for i in 0..8 {
            assert!(tx.send(i));
        }
        drop(tx);
        let got: Vec<i32> = std::iter::from_fn(|| rx.recv()).collect();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn mpsc_two_producers_sum() {
        let (tx, rx) = mpsc::channel(4);
        let tx2 = tx.clone();
        let a = thread::spawn(move || {
            for i in 0..5 {
                assert!(tx.send(i));
            }
        });
        let b = thread::spawn(move || {
            for i in 5..10 {
                assert!(tx2.send(i));
            }
        });
        let mut got = Vec::new();
        while let Some(v) = rx.recv() {
            got.push(v);
        }
        a.join().unwrap();
        b.join().unwrap();
        assert_eq!(got.len(), 10);
        assert_eq!(got.iter().sum::<i32>(), 45);
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn mpsc_accounting_under_contention() {
        let (tx, rx) = mpsc::channel::<u64>(8);
        let mut producers = Vec::new();
        for p in 0..4u64 {
            let tx = tx.clone();
            producers.push(thread::spawn(move || {
                let mut sent = 0u64;
                for i in 0..250 {
                    if tx.send(p * 1000 + i) {
                        sent += 1;
                    }
                }
                sent
            }));
        }
        drop(tx);
        let rx2 = rx.clone();
        let consumer = thread::spawn(move || {
            let mut got = 0u64;
            while rx2.recv().is_some() {
                got += 1;
            }
            got
        });
        let mut got_main = 0u64;
        while rx.recv().is_some() {
            got_main += 1;
        }
        // Chaque envoi réussi est reçu exactement une fois, toutes
        // extrémités confondues.
        let sent: u64 = producers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(sent, 1000);
        assert_eq!(got_main + consumer.join().unwrap(), sent);
    }

    #[test]
    fn try_paths_full_and_empty() {
        let (tx, rx) = mpsc::channel(2);
        assert_eq!(rx.try_recv(), None);
        assert!(tx.try_send(1));
        assert!(tx.try_send(2));
        assert!(!tx.try_send(3));
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.try_recv(), Some(1));
        assert!(tx.try_send(3));
    }

    #[test]
    fn close_is_monotonic() {
        let (tx, rx) = mpsc::channel::<u8>(1);
        assert!(!rx.is_closed());
        tx.close();
        assert!(rx.is_closed());
        tx.close();
        assert!(rx.is_closed());
        assert!(!tx.send(1));
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn drain_after_last_sender() {
        let (tx, rx) = mpsc::channel(4);
        assert!(tx.send(7));
        assert!(tx.send(8));
        drop(tx);
        assert!(rx.is_closed());
        assert_eq!(rx.recv(), Some(7));
        assert_eq!(rx.recv(), Some(8));
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn receiver_drop_fails_send() {
        let (tx, rx) = mpsc::channel(4);
        assert!(tx.send(1));
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.send(2));
        assert!(!tx.try_send(3));
    }

    #[test]
    fn receiver_drop_frees_queued_messages() {
        let payload = std::sync::Arc::new(());
        let (tx, rx) = mpsc::channel(4);
        assert!(tx.send(std::sync::Arc::clone(&payload)));
        assert_eq!(std::sync::Arc::strong_count(&payload), 2);
        drop(rx);
        assert_eq!(std::sync::Arc::strong_count(&payload), 1);
    }

    #[test]
    fn receiver_close_keeps_buffered() {
        let (tx, rx) = mpsc::channel(4);
        assert!(tx.send(1));
        assert!(tx.send(2));
        rx.close();
        assert!(!tx.send(3));
        assert_eq!(rx.try_recv(), Some(1));
        assert_eq!(rx.try_recv(), Some(2));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(matches!(mpsc::try_channel::<u8>(0), Err(ChannelError::Capacity)));
        assert!(matches!(broadcast::try_broadcast::<u8>(0), Err(ChannelError::Capacity)));
    }

    #[test]
    fn send_blocks_until_slot() {
        let (tx, rx) = mpsc::channel(1);
        assert!(tx.send(1));
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            assert_eq!(rx.recv(), Some(1));
            assert_eq!(rx.recv(), Some(2));
        });
        // Bloque jusqu'à la libération de l'unique emplacement.
        assert!(tx.send(2));
        t.join().unwrap();
    }

    #[test]
    fn cloned_receivers_share_stream() {
        let (tx, rx) = mpsc::channel(8);
        let rx2 = rx.clone();
        for i in 0..4 {
            assert!(tx.send(i));
        }
        drop(tx);
        let mut got = Vec::new();
        while let Some(v) = recv_any(&[rx.clone(), rx2.clone()]).map(|(_, v)| v) {
            got.push(v);
        }
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn recv_any_polls_all() {
        let (tx1, rx1) = mpsc::channel(2);
        let (tx2, rx2) = mpsc::channel(2);
        assert!(tx2.send(9));
        let rxs = [rx1, rx2];
        assert_eq!(recv_any(&rxs), Some((1, 9)));
        drop(tx1);
        drop(tx2);
        assert_eq!(recv_any(&rxs), None);
        assert_eq!(recv_any::<i32>(&[]), None);
    }

    #[test]
    fn broadcast_fanout() {
        let tx = broadcast::broadcast::<i32>(4);
        let rx1 = tx.subscribe();
        let rx2 = tx.subscribe();
        assert_eq!(tx.send(1), 2);
        assert_eq!(tx.send(2), 2);
        tx.close();
        for rx in [rx1, rx2] {
            assert_eq!(rx.recv(), Some(1));
            assert_eq!(rx.recv(), Some(2));
            assert_eq!(rx.recv(), None);
        }
    }

    #[test]
    fn broadcast_without_subscribers() {
        let tx = broadcast::broadcast::<i32>(4);
        assert_eq!(tx.send(1), 0);
    }

    #[test]
    fn broadcast_full_subscriber_drops() {
        let tx = broadcast::broadcast::<i32>(1);
        let rx = tx.subscribe();
        assert_eq!(tx.send(1), 1);
        assert_eq!(tx.send(2), 0);
        assert_eq!(rx.try_recv(), Some(1));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn broadcast_subscribers_pace_independently() {
        let tx = broadcast::broadcast::<u32>(8);
        let fast = tx.subscribe();
        let slow = tx.subscribe();
        for i in 0..8 {
            assert_eq!(tx.send(i), 2);
        }
        // `fast` se vide, `slow` ne consomme rien: l'envoi suivant ne livre
        // qu'à `fast`.
        let seen: Vec<u32> = std::iter::from_fn(|| fast.try_recv()).collect();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        assert_eq!(tx.send(8), 1);
        assert_eq!(slow.len(), 8);
        assert_eq!(fast.try_recv(), Some(8));
    }

    #[test]
    fn broadcast_subscribe_after_close() {
        let tx = broadcast::broadcast::<i32>(2);
        tx.close();
        assert!(tx.is_closed());
        let rx = tx.subscribe();
        assert!(rx.is_closed());
        assert_eq!(rx.recv(), None);
        assert_eq!(tx.send(5), 0);
    }

    #[test]
    fn broadcast_dead_subscriber_pruned() {
        let tx = broadcast::broadcast::<i32>(2);
        let rx1 = tx.subscribe();
        let rx2 = tx.subscribe();
        assert_eq!(tx.subscriber_count(), 2);
        drop(rx2);
        assert_eq!(tx.send(3), 1);
        assert_eq!(tx.subscriber_count(), 1);
        assert_eq!(rx1.try_recv(), Some(3));
    }

    #[test]
    fn broadcast_last_publisher_closes() {
        let tx = broadcast::broadcast::<i32>(2);
        let rx = tx.subscribe();
        let tx2 = tx.clone();
        drop(tx);
        // Une poignée publie encore: la diffusion reste ouverte.
        assert_eq!(tx2.send(4), 1);
        drop(tx2);
        assert_eq!(rx.recv(), Some(4));
        assert_eq!(rx.recv(), None);
        assert!(rx.is_closed());
    }
}
