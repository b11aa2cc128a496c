//! Verse catalog, problem-category mapping and message rendering.

use rand::seq::SliceRandom;

use crate::formatting::{escape_html, RULE};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Anxiety,
    Fear,
    Sadness,
    Doubt,
    Relationships,
    General,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Anxiety => "anxiety",
            Category::Fear => "fear",
            Category::Sadness => "sadness",
            Category::Doubt => "doubt",
            Category::Relationships => "relationships",
            Category::General => "general",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verse {
    pub reference: &'static str,
    pub text: &'static str,
}

/// Ordered keyword table; the first category with a matching keyword wins.
const KEYWORDS: &[(Category, &[&str])] = &[
    (Category::Anxiety, &["anxiety", "worry", "stress"]),
    (Category::Fear, &["fear"]),
    (Category::Sadness, &["sad", "depress"]),
    (Category::Doubt, &["doubt", "faith"]),
    (Category::Relationships, &["relation"]),
];

/// Map a free-form classification to a category (case-insensitive substring).
pub fn category_for(classification: &str) -> Category {
    let lower = classification.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(cat, _)| *cat)
        .unwrap_or(Category::General)
}

pub fn verses(category: Category) -> &'static [Verse] {
    match category {
        Category::Anxiety => ANXIETY,
        Category::Fear => FEAR,
        Category::Sadness => SADNESS,
        Category::Doubt => DOUBT,
        Category::Relationships => RELATIONSHIPS,
        Category::General => GENERAL,
    }
}

pub fn pick_verse(category: Category) -> Verse {
    let pool = verses(category);
    pool.choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(GENERAL[0])
}

/// Morning message for a user. `problem_specific` switches the framing.
pub fn render_delivery(name: &str, verse: &Verse, problem_specific: bool, signature: &str) -> String {
    let (intro, outro) = if problem_specific {
        (
            "I've been thinking about you and wanted to share this with you today:",
            "God sees you and knows you, and you are not alone in this. 💪✨\n\nIf you ever want to talk, I'm here. 🤗",
        )
    } else {
        (
            "Here's a word to brighten your day:",
            "Keep shining your light today! ✨",
        )
    };
    format!(
        "🌅 Good morning {name}! 🙏\n\n{intro}\n\n📖 <b>{reference}</b>\n\n\"{text}\"\n\n{RULE}\n\n{outro}\n\n- {signature} 🕊️",
        name = escape_html(name),
        reference = escape_html(verse.reference),
        text = escape_html(verse.text),
        signature = escape_html(signature),
    )
}

const ANXIETY: &[Verse] = &[
    Verse {
        reference: "Philippians 4:6-7",
        text: "Do not be anxious about anything, but in every situation, by prayer and petition, with thanksgiving, present your requests to God. And the peace of God will guard your hearts.",
    },
    Verse {
        reference: "Matthew 6:34",
        text: "Therefore do not worry about tomorrow, for tomorrow will worry about itself. Each day has enough trouble of its own.",
    },
    Verse {
        reference: "1 Peter 5:7",
        text: "Cast all your anxiety on him because he cares for you.",
    },
];

const FEAR: &[Verse] = &[
    Verse {
        reference: "Isaiah 41:10",
        text: "So do not fear, for I am with you; do not be dismayed, for I am your God. I will strengthen you and help you.",
    },
    Verse {
        reference: "2 Timothy 1:7",
        text: "For God has not given us a spirit of fear, but of power and of love and of a sound mind.",
    },
    Verse {
        reference: "Psalm 27:1",
        text: "The LORD is my light and my salvation; whom shall I fear? The LORD is the stronghold of my life; of whom shall I be afraid?",
    },
];

const SADNESS: &[Verse] = &[
    Verse {
        reference: "Psalm 34:18",
        text: "The LORD is close to the brokenhearted and saves those who are crushed in spirit.",
    },
    Verse {
        reference: "John 16:33",
        text: "In this world you will have trouble. But take heart! I have overcome the world.",
    },
    Verse {
        reference: "Psalm 30:5",
        text: "Weeping may stay for the night, but rejoicing comes in the morning.",
    },
];

const DOUBT: &[Verse] = &[
    Verse {
        reference: "Hebrews 11:1",
        text: "Now faith is confidence in what we hope for and assurance about what we do not see.",
    },
    Verse {
        reference: "Mark 9:24",
        text: "Immediately the boy's father exclaimed, 'I do believe; help me overcome my unbelief!'",
    },
    Verse {
        reference: "Romans 10:17",
        text: "Faith comes from hearing the message, and the message is heard through the word about Christ.",
    },
];

const RELATIONSHIPS: &[Verse] = &[
    Verse {
        reference: "1 Corinthians 13:4-7",
        text: "Love is patient, love is kind. It does not envy, it does not boast, it is not proud. It always protects, always trusts, always hopes, always perseveres.",
    },
    Verse {
        reference: "Ephesians 4:32",
        text: "Be kind and compassionate to one another, forgiving each other, just as in Christ God forgave you.",
    },
    Verse {
        reference: "Proverbs 17:17",
        text: "A friend loves at all times, and a brother is born for a time of adversity.",
    },
];

const GENERAL: &[Verse] = &[
    Verse {
        reference: "John 3:16",
        text: "For God so loved the world that he gave his one and only Son, that whoever believes in him shall not perish but have eternal life.",
    },
    Verse {
        reference: "Jeremiah 29:11",
        text: "For I know the plans I have for you, declares the LORD, plans to prosper you and not to harm you, plans to give you hope and a future.",
    },
    Verse {
        reference: "Proverbs 3:5-6",
        text: "Trust in the LORD with all your heart and lean not on your own understanding; in all your ways submit to him, and he will make your paths straight.",
    },
    Verse {
        reference: "Romans 8:28",
        text: "And we know that in all things God works for the good of those who love him, who have been called according to his purpose.",
    },
    Verse {
        reference: "Psalm 46:1",
        text: "God is our refuge and strength, an ever-present help in trouble.",
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_mapping_is_ordered_and_case_insensitive() {
        assert_eq!(category_for("PROBLEM: Anxiety and stress"), Category::Anxiety);
        // "faith" would match Doubt, but Fear comes first in the table.
        assert_eq!(category_for("Fear about faith"), Category::Fear);
        assert_eq!(category_for("feeling DEPRESSED"), Category::Sadness);
        assert_eq!(category_for("Relationship issues"), Category::Relationships);
        assert_eq!(category_for("Financial problems"), Category::General);
        assert_eq!(category_for(""), Category::General);
    }

    #[test]
    fn every_category_has_verses() {
        for cat in [
            Category::Anxiety,
            Category::Fear,
            Category::Sadness,
            Category::Doubt,
            Category::Relationships,
            Category::General,
        ] {
            assert!(!verses(cat).is_empty(), "{}", cat.as_str());
            assert!(verses(cat).contains(&pick_verse(cat)));
        }
    }

    #[test]
    fn render_delivery_escapes_name() {
        let msg = render_delivery("<Ann>", &GENERAL[0], false, "Community");
        assert!(msg.contains("&lt;Ann&gt;"));
        assert!(msg.contains("<b>John 3:16</b>"));
    }
}
