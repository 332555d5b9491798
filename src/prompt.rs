use crate::detector::AnimalKind;
use crate::error::{PawsightError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

const QUALITY_BOOSTERS: &str = "high quality, detailed, professional, masterpiece";
const NEGATIVE_BOOSTERS: &str = "low quality, blurry, distorted, ugly, bad anatomy, deformed";
const ANIMAL_PLACEHOLDER: &str = "{animal_type}";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    #[default]
    Chibi,
    Anime,
    Cartoon,
}

impl Style {
    pub const ALL: [Self; 3] = [Self::Chibi, Self::Anime, Self::Cartoon];

    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Chibi => "chibi",
            Self::Anime => "anime",
            Self::Cartoon => "cartoon",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Chibi => "Chibi Anime",
            Self::Anime => "Anime Style",
            Self::Cartoon => "Cartoon",
        }
    }

    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Chibi => "chibi anime style, kawaii aesthetic, big sparkling eyes, tiny body proportions, pastel colors, adorable, cute",
            Self::Anime => "anime style, vibrant colors, clean lines, cel shaded, expressive, detailed",
            Self::Cartoon => "cartoon illustration style, bold outlines, bright colors, playful, simple shapes, fun",
        }
    }

    /// Parse a style id, falling back to [`Style::Chibi`] for anything unknown.
    #[must_use]
    pub fn from_id_or_default(id: &str) -> Self {
        id.parse().unwrap_or_default()
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Style {
    type Err = PawsightError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|style| style.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PawsightError::Config(format!("Unknown style '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEngineering {
    pub detailed_prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub name_en: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub compatible_animals: Vec<AnimalKind>,
    #[serde(default)]
    pub source_file: Option<String>,
    pub prompt_engineering: PromptEngineering,
}

/// Product metadata loaded from `tryon_metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub products: Vec<Product>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompts {
    pub positive: String,
    pub negative: String,
}

impl Catalog {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PawsightError::NotFound(path.to_owned()),
            _ => PawsightError::Io(e),
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    #[must_use]
    pub fn product(&self, product_id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.product_id == product_id)
    }

    /// Products usable with `animal`, or every product when `None`.
    #[must_use]
    pub fn products_for(&self, animal: Option<AnimalKind>) -> Vec<&Product> {
        self.products
            .iter()
            .filter(|p| animal.map_or(true, |a| p.compatible_animals.contains(&a)))
            .collect()
    }

    /// Fill the product template for `animal` and append the style and quality terms.
    pub fn build_prompt(&self, product_id: &str, style: Style, animal: AnimalKind) -> Result<Prompts> {
        let product = self
            .product(product_id)
            .ok_or_else(|| PawsightError::UnknownProduct(product_id.to_string()))?;
        let engineering = &product.prompt_engineering;

        let base = engineering
            .detailed_prompt
            .replace(ANIMAL_PLACEHOLDER, animal.as_str());
        let positive = format!("{base}, {}, {QUALITY_BOOSTERS}", style.suffix());
        let negative = if engineering.negative_prompt.is_empty() {
            NEGATIVE_BOOSTERS.to_string()
        } else {
            format!("{}, {NEGATIVE_BOOSTERS}", engineering.negative_prompt)
        };

        Ok(Prompts { positive, negative })
    }
}

/// Free-form scene description for products outside the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenePrompt {
    pub subject: String,
    pub scene: String,
    pub product: String,
    pub style: String,
    pub negative: String,
}

impl ScenePrompt {
    /// Outdoor scene with `product` placed in front of a single `animal`.
    #[must_use]
    pub fn for_product(animal: AnimalKind, product: &str) -> Self {
        Self {
            subject: format!("a single {animal} standing on the ground, full body, facing the camera"),
            scene: "outdoor park, grass on the ground".to_string(),
            product: product.to_string(),
            style: "cute pastel anime illustration, chibi style, high quality, soft shading".to_string(),
            negative: "low quality, blurry, bad anatomy, deformed, extra legs, extra heads, \
                       extra animals, horse, human, cropped, cut off, text, watermark, logo"
                .to_string(),
        }
    }

    #[must_use]
    pub fn build(&self) -> Prompts {
        let Self {
            subject,
            scene,
            product,
            style,
            negative,
        } = self;
        let positive = format!(
            "{subject}, {scene}, the subject is interacting with {product}, \
             {product} is clearly visible in front of the subject, \
             the scene must show {product} on the ground, {style}"
        );
        Prompts {
            positive,
            negative: negative.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        serde_json::from_str(
            r#"{
                "products": [
                    {
                        "product_id": "collar_red",
                        "name_en": "Red collar",
                        "category": "accessories",
                        "compatible_animals": ["dog", "cat"],
                        "source_file": "collar.png",
                        "prompt_engineering": {
                            "detailed_prompt": "a cute {animal_type} wearing a red collar",
                            "negative_prompt": "no collar"
                        }
                    },
                    {
                        "product_id": "bowl",
                        "name_en": "Slow feeder",
                        "compatible_animals": ["dog"],
                        "prompt_engineering": { "detailed_prompt": "a {animal_type} eating" }
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn builds_catalog_prompt() {
        let prompts = catalog()
            .build_prompt("collar_red", Style::Anime, AnimalKind::Cat)
            .unwrap();
        assert_eq!(
            prompts.positive,
            "a cute cat wearing a red collar, anime style, vibrant colors, clean lines, \
             cel shaded, expressive, detailed, high quality, detailed, professional, masterpiece"
        );
        assert_eq!(
            prompts.negative,
            "no collar, low quality, blurry, distorted, ugly, bad anatomy, deformed"
        );
    }

    #[test]
    fn missing_negative_uses_only_boosters() {
        let prompts = catalog()
            .build_prompt("bowl", Style::Chibi, AnimalKind::Dog)
            .unwrap();
        assert!(prompts.positive.starts_with("a dog eating, chibi anime style"));
        assert_eq!(prompts.negative, NEGATIVE_BOOSTERS);
    }

    #[test]
    fn unknown_product_is_an_error() {
        assert!(matches!(
            catalog().build_prompt("nope", Style::Chibi, AnimalKind::Dog),
            Err(PawsightError::UnknownProduct(id)) if id == "nope"
        ));
    }

    #[test]
    fn unknown_style_falls_back_to_chibi() {
        assert_eq!(Style::from_id_or_default("ANIME"), Style::Anime);
        assert_eq!(Style::from_id_or_default("watercolor"), Style::Chibi);
        assert!("watercolor".parse::<Style>().is_err());
    }

    #[test]
    fn filters_products_by_animal() {
        let catalog = catalog();
        let for_cat: Vec<&str> = catalog
            .products_for(Some(AnimalKind::Cat))
            .iter()
            .map(|p| p.product_id.as_str())
            .collect();
        assert_eq!(for_cat, vec!["collar_red"]);
        assert_eq!(catalog.products_for(None).len(), 2);
    }

    #[test]
    fn scene_prompt_mentions_product() {
        let prompts = ScenePrompt::for_product(AnimalKind::Dog, "a strawberry bowl").build();
        assert!(prompts.positive.starts_with("a single dog standing on the ground"));
        assert_eq!(prompts.positive.matches("a strawberry bowl").count(), 3);
        assert!(prompts.negative.contains("watermark"));
    }
}
