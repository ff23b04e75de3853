/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use super::EvictionModule;
use crate::pager::Frame;

/// Second chance (clock) eviction.
///
/// A single hand rotates over the frame table. Frames that were accessed since the hand
/// passed them last get their access bit cleared and are skipped once.
/// The hand is never reset, so every frame is inspected once before any frame is inspected again.
pub struct ClockEvictionModule {
    hand: usize,
}

impl ClockEvictionModule {
    /// Index of the frame the hand points to.
    pub fn hand(&self) -> usize {
        self.hand
    }
}

impl EvictionModule for ClockEvictionModule {
    fn new(_frame_count: usize) -> Self {
        Self { hand: 0 }
    }

    fn select_victim(&mut self, frames: &mut [Frame]) -> Option<usize> {
        if frames.is_empty() {
            return None;
        }

        // the first sweep clears every access bit, so the second one always finds a frame
        for _ in 0..2 * frames.len() {
            let index = self.hand;
            self.hand = (index + 1) % frames.len();

            let frame = &mut frames[index];
            if frame.accessed() {
                // page was accessed, give it another chance
                frame.set_accessed(false);
            } else {
                // page lost its chance, choose it
                return Some(index);
            }
        }

        None
    }
}
