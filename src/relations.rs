// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Exchange-rate graph between all traded currencies.
//!
//! Every registered [`RateSource`] prices one directed pair. From those
//! direct pairs, a *recipe* is precomputed for every reachable pair: an
//! ordered list of direct steps, each possibly taken reciprocally, whose
//! composition yields the indirect exchange rate. Recipes are kept minimal
//! by step count; for every known pair the reverse pair is known as well.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use gains_types::{CurrencyCode, CurrencyPair, RateError, RateSource};
use rust_decimal::Decimal;

/// One step of a conversion recipe: a directly priced pair, applied either
/// as-is or reciprocally.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RecipeStep {
    pair: CurrencyPair,
    reciprocal: bool,
}

impl RecipeStep {
    fn new(pair: CurrencyPair, reciprocal: bool) -> Self {
        RecipeStep { pair, reciprocal }
    }

    pub fn pair(&self) -> &CurrencyPair {
        &self.pair
    }

    pub fn reciprocal(&self) -> bool {
        self.reciprocal
    }

    fn reversed(&self) -> Self {
        RecipeStep {
            pair: self.pair.clone(),
            reciprocal: !self.reciprocal,
        }
    }
}

/// A non-empty ordered list of steps whose composition converts one
/// currency into another.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Recipe {
    steps: Vec<RecipeStep>,
}

impl Recipe {
    fn single(step: RecipeStep) -> Self {
        Recipe { steps: vec![step] }
    }

    fn from_steps(steps: Vec<RecipeStep>) -> Self {
        Recipe { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[RecipeStep] {
        &self.steps
    }

    /// The same conversion in the opposite direction: reversed step order,
    /// each step flipped.
    fn reversed(&self) -> Self {
        Recipe {
            steps: self.steps.iter().rev().map(RecipeStep::reversed).collect(),
        }
    }
}

/// Composes rate sources and serves exchange rates between all currencies
/// reachable through them.
#[derive(Debug)]
pub struct CurrencyRelation {
    /// Directly priced pairs.
    sources: HashMap<CurrencyPair, Box<dyn RateSource>>,
    /// Direct pairs in the order they were added; a rebuild replays them.
    insertion_order: Vec<CurrencyPair>,
    /// Shortest known recipe per reachable pair.
    recipes: HashMap<CurrencyPair, Recipe>,
}

impl CurrencyRelation {
    pub fn new() -> Self {
        CurrencyRelation {
            sources: HashMap::new(),
            insertion_order: Vec::new(),
            recipes: HashMap::new(),
        }
    }

    pub fn with_sources(sources: Vec<Box<dyn RateSource>>) -> Self {
        let mut relation = Self::new();
        for source in sources {
            relation.add_source(source);
        }
        relation
    }

    /// Register a rate source. If a source for the same pair has already
    /// been added, it is replaced; the recipe table is extended with every
    /// new conversion the pair makes possible.
    pub fn add_source(&mut self, source: Box<dyn RateSource>) {
        let pair = source.pair().clone();
        if pair.base() == pair.quote() {
            log::warn!("Ignoring rate source for the degenerate pair {}", pair);
            return;
        }
        if self.sources.insert(pair.clone(), source).is_none() {
            self.insertion_order.push(pair.clone());
        }
        self.insert_pair(&pair);
    }

    /// Shortest known recipe per reachable pair.
    pub fn recipes(&self) -> &HashMap<CurrencyPair, Recipe> {
        &self.recipes
    }

    /// Recompute all recipes from scratch by replaying the direct pairs in
    /// the order they were added.
    pub fn rebuild(&mut self) {
        self.recipes.clear();
        let order = self.insertion_order.clone();
        for pair in &order {
            self.insert_pair(pair);
        }
    }

    /// Return the rate for conversion of *from* to *to* at *time*.
    ///
    /// If no direct source exists for the pair, the precomputed indirect
    /// recipe is used. A pair without any recipe yields
    /// [`RateError::NoRoute`], a recipe step without a sample at *time*
    /// yields [`RateError::NoRate`].
    pub fn get_rate(
        &self,
        time: DateTime<Utc>,
        from: &CurrencyCode,
        to: &CurrencyCode,
    ) -> Result<Decimal, RateError> {
        let from = CurrencyCode::new(from);
        let to = CurrencyCode::new(to);
        if from == to {
            return Ok(Decimal::ONE);
        }
        let pair = CurrencyPair::new(from.clone(), to.clone());
        let recipe = self
            .recipes
            .get(&pair)
            .ok_or(RateError::NoRoute { from, to })?;

        let mut rate = Decimal::ONE;
        for step in recipe.steps() {
            let source = self.sources.get(step.pair()).ok_or(RateError::NoRoute {
                from: step.pair().base().clone(),
                to: step.pair().quote().clone(),
            })?;
            let sample = source.get_price(time)?;
            if sample.is_zero() {
                // a zero sample is no usable price
                return Err(RateError::NoRate {
                    pair: step.pair().clone(),
                    time,
                });
            }
            rate = if step.reciprocal() {
                rate / sample
            } else {
                rate * sample
            };
        }
        Ok(rate)
    }

    /// Extend the recipe table with everything the direct pair *new* makes
    /// possible.
    ///
    /// Every known recipe that starts at `new.quote` gets the new pair
    /// prepended, every one that ends at `new.base` gets it appended, and
    /// each prepend/append combination is joined through the new pair.
    /// A candidate only replaces an existing recipe if it is strictly
    /// shorter; whenever a recipe is stored, its reverse is stored for the
    /// reverse pair.
    fn insert_pair(&mut self, new: &CurrencyPair) {
        let step = RecipeStep::new(new.clone(), false);

        let snapshot: Vec<(CurrencyPair, Recipe)> = self
            .recipes
            .iter()
            .map(|(pair, recipe)| (pair.clone(), recipe.clone()))
            .collect();

        // Recipes extended by appending the new pair, and recipes that got
        // it prepended; both are needed again for the join below.
        let mut found_after: Vec<(CurrencyPair, Recipe)> = Vec::new();
        let mut found_before: Vec<(CurrencyPair, Recipe)> = Vec::new();

        for (pair, recipe) in &snapshot {
            if new.quote() == pair.base() && new.base() != pair.quote() {
                // the new pair can be added before this recipe
                let target = CurrencyPair::new(new.base().clone(), pair.quote().clone());
                let mut steps = Vec::with_capacity(recipe.len() + 1);
                steps.push(step.clone());
                steps.extend_from_slice(recipe.steps());
                if self.insert_if_shorter(&target, Recipe::from_steps(steps)) {
                    let mut reverse = self.reverse_of(pair).steps.clone();
                    reverse.push(step.reversed());
                    self.recipes
                        .insert(target.reversed(), Recipe::from_steps(reverse));
                    found_before.push((pair.clone(), recipe.clone()));
                }
            } else if new.base() == pair.quote() && new.quote() != pair.base() {
                // the new pair can be added after this recipe
                let target = CurrencyPair::new(pair.base().clone(), new.quote().clone());
                let mut steps = recipe.steps().to_vec();
                steps.push(step.clone());
                if self.insert_if_shorter(&target, Recipe::from_steps(steps)) {
                    let mut reverse = vec![step.reversed()];
                    reverse.extend_from_slice(&self.reverse_of(pair).steps);
                    self.recipes
                        .insert(target.reversed(), Recipe::from_steps(reverse));
                    found_after.push((pair.clone(), recipe.clone()));
                }
            }
        }

        // If the new pair could be appended to some recipes and prepended to
        // others, it also joins each such pair of recipes together.
        for (fa_pair, fa_recipe) in &found_after {
            for (fb_pair, fb_recipe) in &found_before {
                if fa_pair.base() == fb_pair.quote() {
                    // joining would only produce a pointless self-conversion
                    continue;
                }
                let target = CurrencyPair::new(fa_pair.base().clone(), fb_pair.quote().clone());
                let mut steps = Vec::with_capacity(fa_recipe.len() + fb_recipe.len() + 1);
                steps.extend_from_slice(fa_recipe.steps());
                steps.push(step.clone());
                steps.extend_from_slice(fb_recipe.steps());
                if self.insert_if_shorter(&target, Recipe::from_steps(steps)) {
                    let mut reverse = self.reverse_of(fb_pair).steps.clone();
                    reverse.push(step.reversed());
                    reverse.extend_from_slice(&self.reverse_of(fa_pair).steps);
                    self.recipes
                        .insert(target.reversed(), Recipe::from_steps(reverse));
                }
            }
        }

        // And finally, the new pair by itself:
        if self.insert_if_shorter(new, Recipe::single(step.clone())) {
            self.recipes
                .insert(new.reversed(), Recipe::single(step.reversed()));
        }
    }

    /// Store *candidate* for *target* if no recipe exists yet or the
    /// candidate is strictly shorter. Equal length leaves the incumbent in
    /// place, keeping repeated inserts stable.
    fn insert_if_shorter(&mut self, target: &CurrencyPair, candidate: Recipe) -> bool {
        match self.recipes.get(target) {
            Some(incumbent) if incumbent.len() <= candidate.len() => false,
            _ => {
                self.recipes.insert(target.clone(), candidate);
                true
            }
        }
    }

    fn reverse_of(&self, pair: &CurrencyPair) -> &Recipe {
        self.recipes
            .get(&pair.reversed())
            .expect("every stored recipe has its reverse stored as well")
    }
}

impl Default for CurrencyRelation {
    fn default() -> Self {
        Self::new()
    }
}
