//! Master effects: stereo processors chained behind the engine mix.

mod chorus;
mod compressor;
mod delay;
mod distortion;
mod eq3;
mod eq5;
mod reverb;

pub use chorus::Chorus;
pub use compressor::Compressor;
pub use delay::Delay;
pub use distortion::Distortion;
pub use eq3::Eq3Band;
pub use eq5::{Eq5Band, Eq5Gains};
pub use reverb::Reverb;

use mml_ir::Definitions;

/// A stereo in-place audio processor.
pub trait Effector: Send {
    fn process(&mut self, l: f32, r: f32) -> (f32, f32);
    fn reset(&mut self);
}

/// Applies a sequence of effects in order.
#[derive(Default)]
pub struct Chain {
    effects: Vec<Box<dyn Effector>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, effect: Box<dyn Effector>) {
        self.effects.push(effect);
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn process(&mut self, mut l: f32, mut r: f32) -> (f32, f32) {
        for e in &mut self.effects {
            (l, r) = e.process(l, r);
        }
        (l, r)
    }

    pub fn reset(&mut self) {
        for e in &mut self.effects {
            e.reset();
        }
    }

    /// Build a chain from `#EFFECT0..7{type p1,p2,...}` definitions.
    /// Returns `None` when no directive contributed an effect.
    pub fn from_definitions(defs: &Definitions, sample_rate: u32) -> Option<Self> {
        let mut chain = Chain::new();
        for i in 0..8 {
            let key = format!("EFFECT{i}");
            let Some(raw) = defs.get(&key) else { continue };
            // The captured body still carries the directive name and
            // braces; keep only the inner `type p1,p2,...` text.
            let raw = match (raw.find('{'), raw.rfind('}')) {
                (Some(open), Some(close)) if close > open => &raw[open + 1..close],
                _ => raw.as_str(),
            };
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let (effect_type, params_raw) = match raw.split_once(' ') {
                Some((t, p)) => (t, p),
                None => (raw, ""),
            };
            let params: Vec<f64> = params_raw
                .split(',')
                .filter_map(|p| p.trim().parse::<f64>().ok())
                .collect();
            if let Some(effect) =
                create_effect(&effect_type.trim().to_ascii_lowercase(), &params, sample_rate)
            {
                chain.add(effect);
            }
        }
        if chain.is_empty() {
            None
        } else {
            Some(chain)
        }
    }
}

/// Instantiate one effect by type name, filling missing parameters
/// with their documented defaults.
pub fn create_effect(effect_type: &str, params: &[f64], sample_rate: u32) -> Option<Box<dyn Effector>> {
    let get = |idx: usize, def: f64| params.get(idx).copied().unwrap_or(def);
    Some(match effect_type {
        "delay" => Box::new(Delay::new(
            sample_rate,
            get(0, 250.0),
            get(1, 0.4) as f32,
            get(2, 0.2) as f32,
            get(3, 0.3) as f32,
        )),
        "reverb" => Box::new(Reverb::new(
            sample_rate,
            get(0, 0.5) as f32,
            get(1, 0.7) as f32,
            get(2, 0.25) as f32,
        )),
        "chorus" => Box::new(Chorus::new(
            sample_rate,
            get(0, 15.0) as f32,
            get(1, 0.3) as f32,
            get(2, 3.0) as f32,
            get(3, 1.5) as f32,
            get(4, 0.4) as f32,
        )),
        "dist" | "distortion" => Box::new(Distortion::new(
            sample_rate,
            get(0, 4.0) as f32,
            get(1, 0.5) as f32,
            get(2, 8000.0) as f32,
        )),
        "eq" => Box::new(Eq3Band::new(
            sample_rate,
            get(0, 1.0) as f32,
            get(1, 1.0) as f32,
            get(2, 1.0) as f32,
            get(3, 300.0) as f32,
            get(4, 3000.0) as f32,
        )),
        "comp" | "compressor" => Box::new(Compressor::new(
            sample_rate,
            get(0, -20.0) as f32,
            get(1, 4.0) as f32,
            get(2, 5.0) as f32,
            get(3, 100.0) as f32,
            get(4, 6.0) as f32,
        )),
        _ => return None,
    })
}

pub(crate) fn clamp_f32(v: f32, lo: f32, hi: f32) -> f32 {
    v.clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_applies_effects_in_order() {
        let mut c = Chain::new();
        c.add(Box::new(Distortion::new(44100, 2.0, 1.0, 0.0)));
        c.add(Box::new(Delay::new(44100, 10.0, 0.0, 0.0, 0.5)));
        let (l, r) = c.process(0.5, 0.5);
        assert!(l != 0.0 && r != 0.0);
    }

    #[test]
    fn chain_from_definitions_parses_types_and_params() {
        let mut defs = Definitions::new();
        defs.insert("EFFECT0".into(), "EFFECT0{delay 200,0.5,0.1,0.4}".into());
        defs.insert("EFFECT1".into(), "EFFECT1{reverb}".into());
        let chain = Chain::from_definitions(&defs, 48000).unwrap();
        assert_eq!(chain.effects.len(), 2);
    }

    #[test]
    fn chain_from_definitions_empty_when_no_effects() {
        let defs = Definitions::new();
        assert!(Chain::from_definitions(&defs, 48000).is_none());
    }

    #[test]
    fn unknown_effect_type_is_skipped() {
        let mut defs = Definitions::new();
        defs.insert("EFFECT0".into(), "EFFECT0{flanger 1,2}".into());
        assert!(Chain::from_definitions(&defs, 48000).is_none());
    }
}
