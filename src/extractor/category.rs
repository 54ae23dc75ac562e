use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! categories {
    ($($variant:ident => $id:literal),+ $(,)?) => {
        /// Canonical dish category vocabulary accepted by the catalog.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Category {
            $(#[serde(rename = $id)] $variant),+
        }

        impl Category {
            pub const ALL: &'static [Category] = &[$(Category::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Category::$variant => $id),+
                }
            }
        }
    };
}

categories! {
    Appetizer => "appetizer",
    Salad => "salad",
    Soup => "soup",
    Chowder => "chowder",
    Entree => "entree",
    Pizza => "pizza",
    Burger => "burger",
    Sandwich => "sandwich",
    Wrap => "wrap",
    HotDog => "hot_dog",
    Taco => "taco",
    Pasta => "pasta",
    Seafood => "seafood",
    LobsterRoll => "lobster_roll",
    FriedFish => "fried_fish",
    Steak => "steak",
    Chicken => "chicken",
    Wings => "wings",
    Tenders => "tenders",
    Bbq => "bbq",
    Sushi => "sushi",
    Ramen => "ramen",
    Noodles => "noodles",
    RiceBowl => "rice_bowl",
    Curry => "curry",
    Breakfast => "breakfast",
    Sides => "sides",
    Fries => "fries",
    Dessert => "dessert",
    IceCream => "ice_cream",
    Bakery => "bakery",
    Smoothie => "smoothie",
}

impl Category {
    /// Lenient lookup: case, surrounding whitespace, `-`/space vs `_`, trailing plural `s`.
    pub fn parse(raw: &str) -> Option<Category> {
        let key = raw.trim().to_lowercase().replace(['-', ' '], "_");
        if key.is_empty() {
            return None;
        }
        lookup(&key).or_else(|| key.strip_suffix('s').and_then(lookup))
    }
}

fn lookup(key: &str) -> Option<Category> {
    Category::ALL.iter().copied().find(|c| c.as_str() == key)
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
