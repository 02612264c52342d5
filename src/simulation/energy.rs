//! First-order radio energy model.
//!
//! Transmitting costs electronics energy per bit plus amplifier energy that
//! grows with the square of the distance below the free-space/multipath
//! threshold and with its fourth power above. Receiving costs the
//! electronics energy only. Remaining energy is a traced value: the harness
//! observes it for the per-node energy report and the depleted-node counter.
//!
//! Depletion is a one-way door. The agent is not told; the medium simply
//! stops delivering to (and accepting from) a depleted radio.

use crate::engine::trace::TraceSource;

/// Energy consumed by radio electronics for TX and RX (J/bit).
pub const ENERGY_PER_BIT_ELECTRONICS_J: f64 = 5e-8;

/// Free-space amplifier energy (J/bit/m^2).
pub const ENERGY_FREE_SPACE_AMP_J: f64 = 1e-11;

/// Multipath amplifier energy (J/bit/m^4).
pub const ENERGY_MULTIPATH_AMP_J: f64 = 1.3e-15;

/// Crossover distance between the free-space and multipath amplifier models,
/// sqrt(E_fs / E_mp).
pub const FS_MULTIPATH_THRESHOLD_M: f64 = 87.7;

/// Energy to transmit `bits` over `distance_m`.
pub fn transmit_energy(bits: f64, distance_m: f64) -> f64 {
    let mut energy = bits * ENERGY_PER_BIT_ELECTRONICS_J;
    if distance_m <= FS_MULTIPATH_THRESHOLD_M {
        energy += bits * ENERGY_FREE_SPACE_AMP_J * distance_m.powi(2);
    } else {
        energy += bits * ENERGY_MULTIPATH_AMP_J * distance_m.powi(4);
    }
    energy
}

/// Energy to receive `bits` (electronics only).
pub fn receive_energy(bits: f64) -> f64 {
    bits * ENERGY_PER_BIT_ELECTRONICS_J
}

/// One node's battery with a traced remaining-energy value.
pub struct EnergySource {
    remaining: TraceSource<f64>,
    depleted: bool,
}

impl EnergySource {
    pub fn new(initial_j: f64) -> Self {
        EnergySource {
            remaining: TraceSource::new(initial_j),
            depleted: false,
        }
    }

    pub fn remaining(&self) -> f64 {
        self.remaining.get()
    }

    pub fn is_depleted(&self) -> bool {
        self.depleted
    }

    /// Observe remaining-energy updates as `(old, new)` pairs.
    pub fn connect_remaining(&mut self, observer: impl FnMut(f64, f64) + 'static) {
        self.remaining.connect(observer);
    }

    /// Draw `joules` from the battery. Once the battery hits zero it stays
    /// there; further draws are ignored.
    pub fn consume(&mut self, joules: f64) {
        if self.depleted {
            return;
        }
        let new = self.remaining.get() - joules;
        self.remaining.set(new.max(0.0));
        if new <= 0.0 {
            self.depleted = true;
        }
    }
}
