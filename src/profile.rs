//! Maps a quality tier and orientation to concrete encoder settings.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeProfile {
    pub max_bitrate_kbps: u32,
    pub buffer_size_kbps: u32,
    pub width: u32,
    pub height: u32,
    /// Scale-to-fit then letterbox/pillarbox into the exact output frame.
    pub filter: String,
}

struct Tier {
    bitrate_kbps: u32,
    buffer_kbps: u32,
    // landscape frame
    width: u32,
    height: u32,
}

fn tier(quality: Quality) -> Tier {
    match quality {
        Quality::Low => Tier {
            bitrate_kbps: 1_500,
            buffer_kbps: 3_000,
            width: 854,
            height: 480,
        },
        Quality::Medium => Tier {
            bitrate_kbps: 3_000,
            buffer_kbps: 6_000,
            width: 1280,
            height: 720,
        },
        Quality::High => Tier {
            bitrate_kbps: 6_000,
            buffer_kbps: 12_000,
            width: 1920,
            height: 1080,
        },
    }
}

pub fn resolve(quality: Quality, orientation: Orientation) -> EncodeProfile {
    let tier = tier(quality);
    let (width, height) = match orientation {
        Orientation::Landscape => (tier.width, tier.height),
        Orientation::Portrait => (tier.height, tier.width),
    };

    EncodeProfile {
        max_bitrate_kbps: tier.bitrate_kbps,
        buffer_size_kbps: tier.buffer_kbps,
        width,
        height,
        filter: format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
            w = width,
            h = height
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portrait_is_transpose_of_landscape() {
        let landscape = resolve(Quality::High, Orientation::Landscape);
        let portrait = resolve(Quality::High, Orientation::Portrait);

        assert!(landscape.width > landscape.height);
        assert!(portrait.width < portrait.height);
        assert_eq!(landscape.max_bitrate_kbps, portrait.max_bitrate_kbps);
        assert_eq!(landscape.buffer_size_kbps, portrait.buffer_size_kbps);
        assert_eq!((landscape.width, landscape.height), (portrait.height, portrait.width));
    }

    #[test]
    fn filter_targets_oriented_frame() {
        let profile = resolve(Quality::Low, Orientation::Portrait);
        assert_eq!(
            profile.filter,
            "scale=480:854:force_original_aspect_ratio=decrease,pad=480:854:(ow-iw)/2:(oh-ih)/2"
        );
    }

    #[test]
    fn every_pair_resolves_and_tiers_increase() {
        for orientation in [Orientation::Landscape, Orientation::Portrait] {
            let low = resolve(Quality::Low, orientation);
            let medium = resolve(Quality::Medium, orientation);
            let high = resolve(Quality::High, orientation);
            assert!(low.max_bitrate_kbps < medium.max_bitrate_kbps);
            assert!(medium.max_bitrate_kbps < high.max_bitrate_kbps);
            assert!(low.width * low.height < high.width * high.height);
            assert_eq!(medium.buffer_size_kbps, medium.max_bitrate_kbps * 2);
        }
    }

    #[test]
    fn default_tier_is_medium() {
        assert_eq!(Quality::default(), Quality::Medium);
        assert_eq!(
            resolve(Quality::default(), Orientation::default()),
            resolve(Quality::Medium, Orientation::Landscape)
        );
    }
}
