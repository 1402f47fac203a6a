//! Turns a free-text description into a full image generation prompt.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Target look of the generated character.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Style {
    /// Blocky pixel-art character in a biome
    #[default]
    Minecraft,
    /// Vinyl collectible figure in its box
    Funko,
}

impl Style {
    /// Prefix of the blob key, `{prefix}_{hex}.png`.
    pub fn key_prefix(self) -> &'static str {
        match self {
            Style::Minecraft => "minecraft",
            Style::Funko => "funko",
        }
    }

    /// Container the style's artifacts are published into.
    pub fn container(self) -> &'static str {
        match self {
            Style::Minecraft => "minecraft",
            Style::Funko => "images",
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Style::Minecraft => "Minecraft",
            Style::Funko => "Funko Pop",
        })
    }
}

/// Background scene for Minecraft characters.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Biome {
    #[default]
    Forest,
    Plains,
    Desert,
    Jungle,
    Taiga,
    Savanna,
    Swamp,
    SnowyTundra,
    Mountains,
    Ocean,
    MushroomFields,
    Nether,
    End,
}

impl fmt::Display for Biome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Biome::Forest => "Forest",
            Biome::Plains => "Plains",
            Biome::Desert => "Desert",
            Biome::Jungle => "Jungle",
            Biome::Taiga => "Taiga",
            Biome::Savanna => "Savanna",
            Biome::Swamp => "Swamp",
            Biome::SnowyTundra => "Snowy Tundra",
            Biome::Mountains => "Mountains",
            Biome::Ocean => "Ocean",
            Biome::MushroomFields => "Mushroom Fields",
            Biome::Nether => "Nether",
            Biome::End => "End",
        })
    }
}

/// Everything about a request other than the description itself.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct StyleParameters {
    /// Target look
    #[serde(default)]
    pub style: Style,
    /// Scene, only used by the Minecraft template
    #[serde(default)]
    pub biome: Biome,
    /// Name of a frame from the frame library, none means no compositing
    #[serde(default)]
    pub frame: Option<String>,
}

impl StyleParameters {
    /// Parameters for `style` with the defaults for everything else.
    pub fn new(style: Style) -> Self {
        Self {
            style,
            ..Default::default()
        }
    }
}

fn subject_line(description: &str, lead: &str) -> String {
    if description.is_empty() {
        format!("{lead}.")
    } else {
        format!("{lead} based on this description: {description}.")
    }
}

fn minecraft_prompt(description: &str, biome: Biome) -> String {
    let subject = subject_line(description, "Create a Minecraft-style character");
    format!(
        r#"{subject}

The character must look like it was built in Minecraft:
- Blocky body made of cubes, with the proportions of a Minecraft player model
- Pixel-art textures with visible square pixels on the skin, clothes and armor
- Any weapons, tools or accessories are pixelated Minecraft items

Composition:
- Full-body shot, the whole character visible from head to feet with space around it
- Wide-angle view, camera slightly above eye level, character centered in the image
- Standing outdoors in a Minecraft {biome} biome built from blocks
- Bright daylight with soft shadows

Do not add any text, logos, watermarks or game UI."#
    )
}

fn funko_prompt(description: &str) -> String {
    let subject = subject_line(
        description,
        "Create a photorealistic image of an official Funko Pop vinyl figure",
    );
    format!(
        r#"{subject}

The figure must have all the classic Funko Pop characteristics:
- Square-shaped head that's disproportionately large compared to the body (about 1/3 of the total height)
- Small, simplified body with basic pose
- Solid black circular eyes with no pupils (the defining Funko feature)
- No mouth or a very simple mouth
- Minimal facial details, just the essential recognizable features
- Small nose or no nose at all
- Simplified hairstyle with clean, solid shapes
- Arms at the sides or in a signature pose
- The figure should be standing on a square black base

The figure should be displayed in a professional product photography style:
- Clean studio lighting with soft shadows
- Displayed inside the official Funko Pop clear plastic box with the black "POP!" logo in the top corner
- Crisp, clear focus on the figure
- Slight 3/4 angle view showing front and side
- Clean background with slight gradient

The image should be indistinguishable from an official Funko Pop product photo found on online stores."#
    )
}

/// Builds the generation prompt for `description` in the requested style.
///
/// Never fails: an empty description just gives a less specific prompt.
/// A non-empty description is embedded verbatim.
pub fn build_prompt(description: &str, params: &StyleParameters) -> String {
    match params.style {
        Style::Minecraft => minecraft_prompt(description, params.biome),
        Style::Funko => funko_prompt(description),
    }
}
