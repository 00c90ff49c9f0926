//! Ranking coefficients.
//!
//! Coefficients are bit-shift amounts, not linear weights: a bonus term is
//! shifted left by its coefficient before summing, so a term with a larger
//! coefficient dominates all smaller ones combined. Profiles serialize to
//! JSON so deployments can tune them without a rebuild.

use serde::{Deserialize, Serialize};

use crate::search::query::ContentDomain;

/// Named shift coefficients of the post-ranking score.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingProfile {
    /// Bonus when the image flag matches an image query.
    pub cat_has_image: u32,

    /// Bonus when the audio flag matches an audio query.
    pub cat_has_audio: u32,

    /// Bonus when the video flag matches a video query.
    pub cat_has_video: u32,

    /// Bonus when the application flag matches an app query.
    pub cat_has_app: u32,

    /// Bonus when URL or title matches the caller's prefer pattern.
    pub prefer: u32,

    /// Bonus per URL path token found in the accumulated top-word list.
    pub url_comp_in_top_list: u32,

    /// Bonus per title token found in the accumulated top-word list.
    pub descr_comp_in_top_list: u32,

    /// Bonus when a query word occurs literally in the URL.
    pub app_url: u32,

    /// Bonus when a query word occurs literally in the title.
    pub app_title: u32,
}

impl Default for RankingProfile {
    fn default() -> Self {
        RankingProfile {
            cat_has_image: 0,
            cat_has_audio: 0,
            cat_has_video: 0,
            cat_has_app: 0,
            prefer: 15,
            url_comp_in_top_list: 10,
            descr_comp_in_top_list: 10,
            app_url: 12,
            app_title: 13,
        }
    }
}

impl RankingProfile {
    /// Default profile for a content domain: media queries boost the
    /// matching category flag to the top of the coefficient range.
    pub fn for_domain(domain: ContentDomain) -> Self {
        let mut profile = RankingProfile::default();
        match domain {
            ContentDomain::Text => {}
            ContentDomain::Image => profile.cat_has_image = 20,
            ContentDomain::Audio => profile.cat_has_audio = 20,
            ContentDomain::Video => profile.cat_has_video = 20,
            ContentDomain::App => profile.cat_has_app = 20,
        }
        profile
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from a JSON string; missing fields fall back to defaults.
    pub fn from_json(s: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}
