//! Bandwidth adapter: fit (bitrate, frames per packet) under a server cap.

use crate::config::{NetworkConfig, QualityConfig};

/// Lowest bitrate the adapter will ever emit.
pub const BITRATE_FLOOR: i32 = 8_000;

/// Packetization actually in effect after applying the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthBudget {
    pub bitrate: i32,
    pub frames_per_packet: u32,
    pub allow_low_delay: bool,
}

/// Total network rate in bits/s for the given encoder settings, including
/// the per-packet protocol overhead.
///
/// Overhead per packet: 20 (IP) + 8 (UDP) + 4 (crypt) + 1 (header) +
/// 2 (sequence) bytes, plus 12 for positional data, plus 12 when tunnelled
/// over TCP, plus one payload header byte per frame. The `800 / frames`
/// factor converts bytes per packet at `100 / frames` packets/s into bits/s,
/// with the original integer rounding kept intact.
pub fn network_bandwidth(net: &NetworkConfig, bitrate: i32, frames: u32) -> i32 {
    let mut overhead: i32 = 20
        + 8
        + 4
        + 1
        + 2
        + if net.transmit_position { 12 } else { 0 }
        + if net.tcp_mode { 12 } else { 0 }
        + frames as i32;
    overhead *= 800 / frames as i32;
    overhead + bitrate
}

/// Solves for the settings closest to `quality` that fit under
/// `net.max_bandwidth`. Frames per packet are bumped first (cheaper than
/// losing bitrate), then the bitrate walks down in 1000 bit/s steps to the
/// floor.
pub fn adjust_bandwidth(net: &NetworkConfig, quality: &QualityConfig) -> BandwidthBudget {
    let mut frames = quality.frames_per_packet.max(1);
    let mut bitrate = quality.quality;
    let cap = net.max_bandwidth;

    if cap != -1 && network_bandwidth(net, bitrate, frames) > cap {
        if frames <= 4 && cap <= 32_000 {
            frames = 4;
        } else {
            if frames == 1 && cap <= 64_000 {
                frames = 2;
            }
            if frames == 2 && cap <= 48_000 {
                frames = 4;
            }
        }
        if network_bandwidth(net, bitrate, frames) > cap {
            loop {
                bitrate -= 1000;
                if bitrate <= BITRATE_FLOOR || network_bandwidth(net, bitrate, frames) <= cap {
                    break;
                }
            }
        }
    }

    BandwidthBudget {
        bitrate: bitrate.max(BITRATE_FLOOR),
        frames_per_packet: frames,
        allow_low_delay: quality.allow_low_delay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn net(cap: i32) -> NetworkConfig {
        NetworkConfig {
            max_bandwidth: cap,
            ..NetworkConfig::default()
        }
    }

    fn quality(bitrate: i32, frames: u32) -> QualityConfig {
        QualityConfig {
            quality: bitrate,
            frames_per_packet: frames,
            allow_low_delay: false,
        }
    }

    #[test]
    fn unlimited_cap_keeps_request() {
        let budget = adjust_bandwidth(&net(-1), &quality(96_000, 1));
        assert_eq!(budget.bitrate, 96_000);
        assert_eq!(budget.frames_per_packet, 1);
    }

    #[test]
    fn overhead_grows_with_position_and_tcp() {
        let plain = network_bandwidth(&net(-1), 40_000, 2);
        let positional = network_bandwidth(
            &NetworkConfig {
                transmit_position: true,
                ..net(-1)
            },
            40_000,
            2,
        );
        let tunneled = network_bandwidth(
            &NetworkConfig {
                tcp_mode: true,
                ..net(-1)
            },
            40_000,
            2,
        );

        assert_eq!(positional - plain, 12 * 400);
        assert_eq!(tunneled - plain, 12 * 400);
    }

    #[test]
    fn tight_cap_bumps_frames_then_lowers_bitrate() {
        // The spec's S5 scenario: 96 kbit/s at one frame per packet under a
        // 40 kbit/s cap.
        let budget = adjust_bandwidth(&net(40_000), &quality(96_000, 1));

        assert_eq!(budget.frames_per_packet, 4);
        assert!(network_bandwidth(&net(40_000), budget.bitrate, 4) <= 40_000);
        // One step back up breaks the cap again: the walk-down stopped at the
        // first fitting value.
        assert!(network_bandwidth(&net(40_000), budget.bitrate + 1000, 4) > 40_000);
    }

    #[test]
    fn very_tight_cap_clamps_to_floor() {
        let budget = adjust_bandwidth(&net(9_000), &quality(96_000, 1));
        assert_eq!(budget.bitrate, BITRATE_FLOOR);
        assert_eq!(budget.frames_per_packet, 4);
    }

    #[test]
    fn caps_at_or_above_floor_always_fit_or_floor() {
        for cap in (8_000..=120_000).step_by(1000) {
            let budget = adjust_bandwidth(&net(cap), &quality(72_000, 1));
            let fits =
                network_bandwidth(&net(cap), budget.bitrate, budget.frames_per_packet) <= cap;
            assert!(
                fits || budget.bitrate == BITRATE_FLOOR,
                "cap {cap} produced {budget:?}"
            );
        }
    }

    #[test]
    fn integer_division_matches_reference_model() {
        // 3 frames per packet: 800 / 3 == 266 in the integer model.
        let bw = network_bandwidth(&net(-1), 0, 3);
        assert_eq!(bw, (20 + 8 + 4 + 1 + 2 + 3) * 266);
    }
}
