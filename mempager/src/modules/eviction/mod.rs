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

mod clock;

pub use clock::ClockEvictionModule;

use crate::pager::Frame;

/// Decides which frame has to be given up once physical memory is full.
///
/// Eviction is global: `frames` is the whole frame table, shared by all processes.
pub trait EvictionModule {
    fn new(frame_count: usize) -> Self;

    /// Selects the frame that should be evicted next.
    ///
    /// The module may update the access bits of the frames it inspects.
    /// Returns `None` only if no frame can be chosen at all.
    fn select_victim(&mut self, frames: &mut [Frame]) -> Option<usize>;
}
