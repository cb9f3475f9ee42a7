//! Pattern catalog and the default rule / exemplar sets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::EngineError;
use super::retrieval::ExemplarDefinition;
use super::rules::{RuleDefinition, RuleMatcher};
use crate::domain::PatternType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub slug: PatternType,
    /// Display name, e.g. "personal attack".
    pub name: String,
    pub description: String,
}

/// Validated catalog keyed by slug.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: BTreeMap<PatternType, PatternDefinition>,
}

impl Catalog {
    pub fn new(definitions: &[PatternDefinition]) -> Result<Self, EngineError> {
        if definitions.is_empty() {
            return Err(EngineError::Catalog("catalog is empty".to_string()));
        }
        let mut entries = BTreeMap::new();
        for def in definitions {
            let slug = def.slug.as_str();
            let well_formed = !slug.is_empty()
                && slug
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !well_formed {
                return Err(EngineError::Catalog(format!("invalid slug {slug:?}")));
            }
            if entries.insert(def.slug.clone(), def.clone()).is_some() {
                return Err(EngineError::Catalog(format!("duplicate slug {slug:?}")));
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, slug: &PatternType) -> Option<&PatternDefinition> {
        self.entries.get(slug)
    }

    pub fn contains(&self, slug: &PatternType) -> bool {
        self.entries.contains_key(slug)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatternDefinition> {
        self.entries.values()
    }
}

fn pattern(slug: &str, name: &str, description: &str) -> PatternDefinition {
    PatternDefinition {
        slug: PatternType::new(slug),
        name: name.to_string(),
        description: description.to_string(),
    }
}

pub fn default_patterns() -> Vec<PatternDefinition> {
    vec![
        pattern("personal_attack", "personal attack", "Attacks the person instead of the argument."),
        pattern("straw_man", "straw man", "Misrepresents the opponent's position to make it easier to attack."),
        pattern("false_dilemma", "false dilemma", "Presents two options as the only possibilities."),
        pattern("slippery_slope", "slippery slope", "Claims a first step inevitably leads to an extreme outcome."),
        pattern("appeal_to_fear", "appeal to fear", "Uses fear of a threat instead of evidence."),
        pattern("appeal_to_anger", "appeal to anger", "Stokes outrage in place of reasoning."),
        pattern("appeal_to_patriotism", "appeal to patriotism", "Equates agreement with loyalty to the nation."),
        pattern("cherry_picking", "cherry picking", "Selects only the facts that support the claim."),
        pattern("hyperbole", "hyperbole", "Exaggerates to amplify the argument."),
        pattern("labeling", "labeling", "Attaches a loaded label instead of engaging with the position."),
        pattern("insinuation", "insinuation", "Implies an accusation without stating or supporting it."),
        pattern("change_of_subject", "change of subject", "Shifts the discussion away from the question at hand."),
    ]
}

fn lexicon(id: &str, slug: &str, confidence: f64, terms: &[&str]) -> RuleDefinition {
    RuleDefinition {
        id: id.to_string(),
        pattern_type: PatternType::new(slug),
        confidence,
        matcher: RuleMatcher::Lexicon {
            terms: terms.iter().map(|t| t.to_string()).collect(),
        },
    }
}

fn sequence(id: &str, slug: &str, confidence: f64, lead: &[&str], follow: &[&str]) -> RuleDefinition {
    RuleDefinition {
        id: id.to_string(),
        pattern_type: PatternType::new(slug),
        confidence,
        matcher: RuleMatcher::Sequence {
            lead: lead.iter().map(|t| t.to_string()).collect(),
            follow: follow.iter().map(|t| t.to_string()).collect(),
        },
    }
}

pub fn default_rules() -> Vec<RuleDefinition> {
    vec![
        lexicon(
            "personal_attack.insults",
            "personal_attack",
            0.6,
            &["liar", "fool", "idiot", "moron", "crook", "clown", "loser", "incompetent", "corrupt"],
        ),
        sequence(
            "straw_man.so_you_are_saying",
            "straw_man",
            0.5,
            &["so you're saying", "so what you're saying", "they want to", "my opponent wants to"],
            &["all", "every", "abolish", "destroy", "ban", "nothing"],
        ),
        lexicon(
            "false_dilemma.only_two",
            "false_dilemma",
            0.55,
            &["only two options", "only two choices", "there is no other way", "no alternative", "no middle ground"],
        ),
        sequence("false_dilemma.either_or", "false_dilemma", 0.45, &["either"], &["or"]),
        sequence(
            "slippery_slope.chain",
            "slippery_slope",
            0.5,
            &["if we", "once we", "if you", "if they"],
            &["next thing", "before you know it", "inevitably", "end up", "lead to"],
        ),
        lexicon(
            "appeal_to_fear.threat",
            "appeal_to_fear",
            0.45,
            &["catastrophe", "threat to", "terrifying", "chaos", "destroy our", "you will not be safe"],
        ),
        lexicon(
            "appeal_to_anger.outrage",
            "appeal_to_anger",
            0.45,
            &["outrageous", "disgrace", "disgusting", "shameful", "sick and tired"],
        ),
        lexicon(
            "appeal_to_patriotism.loyalty",
            "appeal_to_patriotism",
            0.5,
            &["real americans", "true patriots", "our great nation", "un-american", "love this country"],
        ),
        lexicon(
            "cherry_picking.single_case",
            "cherry_picking",
            0.35,
            &["just look at", "this one example", "the only study", "one single case"],
        ),
        lexicon(
            "hyperbole.superlatives",
            "hyperbole",
            0.4,
            &["the worst", "the greatest", "in history", "of all time", "never before", "a million times", "total disaster"],
        ),
        lexicon(
            "labeling.loaded_labels",
            "labeling",
            0.45,
            &["radical", "extremist", "socialist", "fascist", "communist", "snowflake"],
        ),
        lexicon(
            "insinuation.hints",
            "insinuation",
            0.45,
            &["some people say", "people are saying", "i'm just asking", "what are they hiding", "makes you wonder"],
        ),
        lexicon(
            "change_of_subject.deflection",
            "change_of_subject",
            0.4,
            &["but what about", "let's talk about", "the real issue is", "that's not the point"],
        ),
    ]
}

fn exemplar(id: &str, slug: &str, text: &str) -> ExemplarDefinition {
    ExemplarDefinition {
        id: id.to_string(),
        pattern_type: PatternType::new(slug),
        text: text.to_string(),
    }
}

pub fn default_exemplars() -> Vec<ExemplarDefinition> {
    vec![
        exemplar("ex-pa-1", "personal_attack", "my opponent is a liar and nobody should trust a word he says"),
        exemplar("ex-pa-2", "personal_attack", "how can you listen to someone so stupid and dishonest"),
        exemplar("ex-sm-1", "straw_man", "so you are saying we should just open the borders to everyone"),
        exemplar("ex-sm-2", "straw_man", "they want to take away every single car from hard working people"),
        exemplar("ex-fd-1", "false_dilemma", "either you are with us or you are against us"),
        exemplar("ex-fd-2", "false_dilemma", "we either cut taxes now or the economy collapses"),
        exemplar("ex-ss-1", "slippery_slope", "if we allow this today then tomorrow they will take everything"),
        exemplar("ex-af-1", "appeal_to_fear", "if he wins your family will not be safe in your own home"),
        exemplar("ex-aa-1", "appeal_to_anger", "it is an outrage what they have done to this town and you should be furious"),
        exemplar("ex-ap-1", "appeal_to_patriotism", "anyone who loves this country would vote for this bill"),
        exemplar("ex-cp-1", "cherry_picking", "just look at this one town where crime went up after the law passed"),
        exemplar("ex-hy-1", "hyperbole", "this is the worst deal in the history of the world"),
        exemplar("ex-lb-1", "labeling", "she is a radical extremist who wants to destroy everything"),
        exemplar("ex-in-1", "insinuation", "i am not saying he took the money but people are asking questions"),
        exemplar("ex-cs-1", "change_of_subject", "but what about the scandal his party had ten years ago"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_is_valid_and_covers_default_rules_and_exemplars() {
        let catalog = Catalog::new(&default_patterns()).unwrap();
        assert_eq!(catalog.len(), 12);
        for rule in default_rules() {
            assert!(catalog.contains(&rule.pattern_type), "{}", rule.id);
        }
        for ex in default_exemplars() {
            assert!(catalog.contains(&ex.pattern_type), "{}", ex.id);
        }
        assert_eq!(
            catalog.get(&PatternType::new("personal_attack")).unwrap().name,
            "personal attack"
        );
    }

    #[test]
    fn duplicate_and_malformed_slugs_are_rejected() {
        let mut defs = default_patterns();
        defs.push(defs[0].clone());
        assert!(matches!(Catalog::new(&defs), Err(EngineError::Catalog(_))));

        let bad = vec![pattern("Ad Hominem", "ad hominem", "")];
        assert!(Catalog::new(&bad).is_err());
        assert!(Catalog::new(&[]).is_err());
    }
}
