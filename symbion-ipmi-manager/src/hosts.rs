/**
 * HOST REGISTRY - Cache hôte → poller avec circuit breaker de joignabilité
 *
 * RÔLE :
 * - Affectation stable d'un hôte à un poller (décidée une seule fois via le LoadBalancer)
 * - Fenêtre de backoff après une erreur de lien (réseau, passerelle, timeout)
 * - Éviction TTL des hôtes plus sollicités (libère le slot côté LoadBalancer)
 *
 * ÉTATS : Reachable → (erreur de lien) → Backoff(until) → (until dépassé + nouvelle
 * tentative réussie) → Reachable. Une erreur de config ne change pas l'état.
 */

use std::collections::HashMap;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::balancer::LoadBalancer;
use crate::models::HostId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub host_id: HostId,
    /// Poller affecté, immuable pour la durée de vie de l'entrée
    pub worker: usize,
    pub unreachable_until: Option<OffsetDateTime>,
    /// Début de la série d'erreurs de lien en cours
    pub errors_from: Option<OffsetDateTime>,
    /// Hôte déclaré indisponible auprès de l'annuaire
    pub unavailable: bool,
    pub last_seen: OffsetDateTime,
}

/// Durées de backoff : courtes tant que la série d'erreurs est récente,
/// longues une fois l'hôte déclaré indisponible
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub unreachable_period: Duration,
    pub unreachable_delay: Duration,
    pub unavailable_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            unreachable_period: Duration::seconds(45),
            unreachable_delay: Duration::seconds(15),
            unavailable_delay: Duration::seconds(60),
        }
    }
}

/// Résultat d'une erreur de lien enregistrée
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub until: OffsetDateTime,
    /// true uniquement au passage en indisponible
    pub became_unavailable: bool,
}

pub struct HostRegistry {
    hosts: HashMap<HostId, HostEntry>,
    ttl: Duration,
    policy: BackoffPolicy,
}

impl HostRegistry {
    pub fn new(ttl: Duration, policy: BackoffPolicy) -> Self {
        Self {
            hosts: HashMap::new(),
            ttl,
            policy,
        }
    }

    /// Retourne l'entrée de l'hôte (last_seen rafraîchi) ou la crée via le balancer.
    /// None seulement si le pool est vide.
    pub fn resolve(&mut self, host_id: HostId, now: OffsetDateTime, balancer: &mut LoadBalancer) -> Option<&HostEntry> {
        if let Some(entry) = self.hosts.get_mut(&host_id) {
            entry.last_seen = now;
            return self.hosts.get(&host_id);
        }

        let worker = balancer.pick_worker_for_new_host()?;
        debug!(host_id, worker, "assigned new host");
        let entry = self.hosts.entry(host_id).or_insert(HostEntry {
            host_id,
            worker,
            unreachable_until: None,
            errors_from: None,
            unavailable: false,
            last_seen: now,
        });
        Some(&*entry)
    }

    pub fn get(&self, host_id: HostId) -> Option<&HostEntry> {
        self.hosts.get(&host_id)
    }

    /// Réponse reçue de l'hôte. Retourne true si une série d'erreurs vient de se terminer.
    pub fn mark_reachable(&mut self, host_id: HostId, now: OffsetDateTime) -> bool {
        let Some(entry) = self.hosts.get_mut(&host_id) else {
            return false;
        };
        let recovered = entry.errors_from.is_some();
        entry.unreachable_until = None;
        entry.errors_from = None;
        entry.unavailable = false;
        entry.last_seen = now;
        recovered
    }

    pub fn mark_unreachable(&mut self, host_id: HostId, now: OffsetDateTime, backoff_until: OffsetDateTime) {
        if let Some(entry) = self.hosts.get_mut(&host_id) {
            entry.errors_from.get_or_insert(now);
            entry.unreachable_until = Some(backoff_until);
            entry.last_seen = now;
        }
    }

    /// Enregistre une erreur de lien et calcule la fenêtre de backoff selon la politique
    pub fn record_link_error(&mut self, host_id: HostId, now: OffsetDateTime) -> Option<Backoff> {
        let policy = self.policy;
        let entry = self.hosts.get(&host_id)?;
        let errors_from = entry.errors_from.unwrap_or(now);
        let was_unavailable = entry.unavailable;

        let unavailable = now - errors_from >= policy.unreachable_period;
        let until = if unavailable {
            now + policy.unavailable_delay
        } else {
            now + policy.unreachable_delay
        };

        self.mark_unreachable(host_id, now, until);
        if let Some(entry) = self.hosts.get_mut(&host_id) {
            entry.unavailable = unavailable;
        }

        Some(Backoff {
            until,
            became_unavailable: unavailable && !was_unavailable,
        })
    }

    pub fn is_skippable(&self, host_id: HostId, now: OffsetDateTime) -> bool {
        self.hosts
            .get(&host_id)
            .and_then(|entry| entry.unreachable_until)
            .map(|until| now < until)
            .unwrap_or(false)
    }

    /// Évince les hôtes non vus depuis plus que le TTL et libère leur slot
    pub fn sweep(&mut self, now: OffsetDateTime, balancer: &mut LoadBalancer) -> Vec<HostEntry> {
        let cutoff = now - self.ttl;
        let expired: Vec<HostId> = self
            .hosts
            .values()
            .filter(|entry| entry.last_seen < cutoff)
            .map(|entry| entry.host_id)
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for host_id in expired {
            if let Some(entry) = self.hosts.remove(&host_id) {
                balancer.release(entry.worker);
                evicted.push(entry);
            }
        }

        if !evicted.is_empty() {
            info!(evicted = evicted.len(), remaining = self.hosts.len(), "host cache cleanup");
        }
        evicted
    }

    /// Nombre d'hôtes dans le cache
    pub fn tracked(&self) -> usize {
        self.hosts.len()
    }

    pub fn in_backoff(&self, now: OffsetDateTime) -> usize {
        self.hosts.keys().filter(|&&id| self.is_skippable(id, now)).count()
    }
}
