//! Krawall -> XM effect translation
//!
//! Most effects are a table lookup: the output effect byte is the high byte
//! of the replacement, the operand is the replacement's low byte OR'd with
//! the masked source operand. A handful of opcodes split across several XM
//! opcodes depending on the operand range and are remapped algorithmically.

/// Table entry meaning "this effect has no XM counterpart".
pub const DROP: u16 = 0xFFFF;

/// `(replacement, operand mask)` indexed by Krawall effect code.
pub const EFFECT_MAP: [(u16, u8); 51] = [
    (DROP, 0x00),     // 0: none
    (0x0F00, 0xFF),   // 1: speed (dropped when out of XM's speed range)
    (0x0F00, 0xFF),   // 2: BPM
    (0x0F00, 0xFF),   // 3: speed or BPM by value
    (0x0B00, 0xFF),   // 4: pattern jump
    (0x0D00, 0xFF),   // 5: pattern break
    (0x0A00, 0xFF),   // 6: volume slide (S3M form, fine variants split off)
    (0x0A00, 0xFF),   // 7: volume slide
    (0x0EB0, 0x0F),   // 8: fine volume slide down
    (0x0EA0, 0x0F),   // 9: fine volume slide up
    (0x0200, 0xFF),   // 10: porta down
    (0x0200, 0xFF),   // 11: porta down (S3M form, fine variants split off)
    (0x0E20, 0x0F),   // 12: fine porta down
    (0x2120, 0x0F),   // 13: extra fine porta down
    (0x0100, 0xFF),   // 14: porta up
    (0x0100, 0xFF),   // 15: porta up (S3M form, fine variants split off)
    (0x0E10, 0x0F),   // 16: fine porta up
    (0x2110, 0x0F),   // 17: extra fine porta up
    (0x0C00, 0xFF),   // 18: set volume
    (0x0300, 0xFF),   // 19: porta to note
    (0x0400, 0xFF),   // 20: vibrato
    (0x1D00, 0xFF),   // 21: tremor
    (0x0000, 0xFF),   // 22: arpeggio
    (0x0600, 0xFF),   // 23: volume slide + vibrato
    (0x0500, 0xFF),   // 24: volume slide + porta
    (DROP, 0x00),     // 25: channel volume
    (DROP, 0x00),     // 26: channel volume slide
    (0x0900, 0xFF),   // 27: sample offset
    (0x1900, 0xFF),   // 28: panning slide
    (0x1B00, 0xFF),   // 29: multi retrig
    (0x0700, 0xFF),   // 30: tremolo
    (DROP, 0x00),     // 31: fine vibrato
    (0x1000, 0xFF),   // 32: global volume
    (0x1100, 0xFF),   // 33: global volume slide
    (0x0800, 0xFF),   // 34: set panning
    (0x2200, 0xFF),   // 35: panbrello (OpenMPT extension)
    (DROP, 0x00),     // 36: order-list marker
    (0x0E30, 0x0F),   // 37: glissando control
    (0x0E40, 0x0F),   // 38: vibrato waveform
    (0x0E70, 0x0F),   // 39: tremolo waveform
    (DROP, 0x00),     // 40: panbrello waveform
    (DROP, 0x00),     // 41: pattern delay in ticks
    (0x0E80, 0x0F),   // 42: old-style panning
    (0x0E60, 0x0F),   // 43: pattern loop
    (0x0EC0, 0x0F),   // 44: note cut
    (0x0ED0, 0x0F),   // 45: note delay
    (0x0EE0, 0x0F),   // 46: pattern delay in rows
    (0x1500, 0xFF),   // 47: envelope set position
    (DROP, 0x00),     // 48: sample offset high bits
    (DROP, 0x00),     // 49
    (DROP, 0x00),     // 50
];

/// Table lookup; unknown codes drop.
pub fn lookup(code: u8) -> (u16, u8) {
    EFFECT_MAP
        .get(code as usize)
        .copied()
        .unwrap_or((DROP, 0x00))
}

/// Per-channel transcoding state, rebuilt for every pattern.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelState {
    /// Shared operand memory: an operand of 0 reuses the channel's last
    /// non-zero operand, the way ST3 replays these effects.
    pub s3m_memory: u8,
    /// Virtual pitch tracked for portamento clipping, in note*16 units.
    pub porta: i32,
    /// Last instrument seen on the channel, for default-pan injection.
    pub last_instrument: u16,
}

impl ChannelState {
    fn recall(&mut self, op: u8) -> u8 {
        if op == 0 {
            self.s3m_memory
        } else {
            self.s3m_memory = op;
            op
        }
    }
}

/// Outcome of translating one effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remapped {
    /// No XM counterpart; drop silently.
    None,
    /// No XM counterpart; worth a warning.
    Lost,
    Effect { effect: u8, op: u8 },
    /// Fine volume-slide component moves to the volume column; the effect
    /// column keeps a bare vibrato/porta continuation.
    FineVolume { volume: u8, effect: u8 },
}

/// Translate a Krawall effect into XM columns, applying operand memory and
/// the operand-range splits.
pub fn remap(code: u8, op: u8, state: &mut ChannelState) -> Remapped {
    match code {
        1 => {
            // XM's F command reads operands >= 0x20 as BPM
            if op == 0 || op >= 0x20 {
                Remapped::Lost
            } else {
                Remapped::Effect { effect: 0x0F, op }
            }
        }
        6 => {
            let op = state.recall(op);
            if op & 0xF0 == 0xF0 {
                Remapped::Effect {
                    effect: 0x0E,
                    op: 0xB0 | (op & 0x0F),
                }
            } else if op & 0x0F == 0x0F && op != 0x0F {
                Remapped::Effect {
                    effect: 0x0E,
                    op: 0xA0 | (op >> 4),
                }
            } else {
                Remapped::Effect { effect: 0x0A, op }
            }
        }
        11 | 15 => {
            let up = code == 15;
            let nibble = if up { 0x10 } else { 0x20 };
            let op = state.recall(op);
            if op & 0xF0 == 0xF0 {
                Remapped::Effect {
                    effect: 0x0E,
                    op: nibble | (op & 0x0F),
                }
            } else if op & 0xF0 == 0xE0 {
                Remapped::Effect {
                    effect: 0x21,
                    op: nibble | (op & 0x0F),
                }
            } else {
                Remapped::Effect {
                    effect: if up { 0x01 } else { 0x02 },
                    op,
                }
            }
        }
        23 | 24 => {
            let continuation = if code == 24 { 0x03 } else { 0x04 };
            let op = state.recall(op);
            if op & 0xF0 == 0xF0 {
                Remapped::FineVolume {
                    volume: 0x80 | (op & 0x0F),
                    effect: continuation,
                }
            } else if op & 0x0F == 0x0F && op != 0x0F {
                Remapped::FineVolume {
                    volume: 0x90 | (op >> 4),
                    effect: continuation,
                }
            } else {
                Remapped::Effect {
                    effect: if code == 24 { 0x05 } else { 0x06 },
                    op,
                }
            }
        }
        25 | 26 | 31 => Remapped::Lost,
        29 => Remapped::Effect {
            effect: 0x1B,
            op: if op & 0xF0 == 0 { op | 0x80 } else { op },
        },
        _ => {
            let (replacement, mask) = lookup(code);
            if replacement == DROP {
                Remapped::None
            } else {
                Remapped::Effect {
                    effect: (replacement >> 8) as u8,
                    op: (replacement & 0xFF) as u8 | (op & mask),
                }
            }
        }
    }
}

/// The six portamento-family effects tracked for pitch clipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortaKind {
    MainUp,
    MainDown,
    FineUp,
    FineDown,
    ExtraFineUp,
    ExtraFineDown,
}

/// Classify an already-remapped XM effect as a porta-family member.
pub fn porta_kind(effect: u8, op: u8) -> Option<PortaKind> {
    match (effect, op >> 4) {
        (0x01, _) => Some(PortaKind::MainUp),
        (0x02, _) => Some(PortaKind::MainDown),
        (0x0E, 0x1) => Some(PortaKind::FineUp),
        (0x0E, 0x2) => Some(PortaKind::FineDown),
        (0x21, 0x1) => Some(PortaKind::ExtraFineUp),
        (0x21, 0x2) => Some(PortaKind::ExtraFineDown),
        _ => None,
    }
}

impl PortaKind {
    fn is_down(self) -> bool {
        matches!(
            self,
            PortaKind::MainDown | PortaKind::FineDown | PortaKind::ExtraFineDown
        )
    }

    /// Pitch units moved per row by one operand unit, and the largest
    /// operand the effect encoding can hold.
    fn scale(self, speed: u8) -> (i32, i32) {
        match self {
            PortaKind::MainUp | PortaKind::MainDown => {
                (4 * (speed as i32 - 1).max(0), 0xFF)
            }
            PortaKind::FineUp | PortaKind::FineDown => (4, 0x0F),
            PortaKind::ExtraFineUp | PortaKind::ExtraFineDown => (1, 0x0F),
        }
    }

    fn operand(self, op: u8) -> u8 {
        match self {
            PortaKind::MainUp | PortaKind::MainDown => op,
            _ => op & 0x0F,
        }
    }

    fn rebuild(self, fit: i32, op: u8) -> u8 {
        match self {
            PortaKind::MainUp | PortaKind::MainDown => fit as u8,
            _ => (op & 0xF0) | fit as u8,
        }
    }
}

/// What to do with a clipped slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortaOutcome {
    /// Emit the effect with this operand.
    Keep(u8),
    /// Pitch already at the floor: replace the event with a note cut.
    Cut,
}

/// Advance the channel's virtual pitch for one row of a porta effect; a
/// downward slide that would cross zero is scaled to land exactly on zero
/// or, failing that, replaced by a note cut.
pub fn clip_porta(kind: PortaKind, op: u8, state: &mut ChannelState, speed: u8) -> PortaOutcome {
    let (per_unit, max_fit) = kind.scale(speed);
    if per_unit <= 0 {
        return PortaOutcome::Keep(op);
    }
    let delta = per_unit * kind.operand(op) as i32;
    if !kind.is_down() {
        state.porta += delta;
        return PortaOutcome::Keep(op);
    }
    if state.porta - delta >= 0 {
        state.porta -= delta;
        return PortaOutcome::Keep(op);
    }
    let fit = (state.porta / per_unit).min(max_fit);
    if fit > 0 {
        state.porta = 0;
        PortaOutcome::Keep(kind.rebuild(fit, op))
    } else {
        PortaOutcome::Cut
    }
}
